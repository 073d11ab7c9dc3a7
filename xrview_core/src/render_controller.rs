//! Render Controller - Orchestrates the XRView engines once per display frame.
//!
//! This module is the integration layer between the stream-fed engines
//! (transforms, clouds, grids, markers, robot) and the headset-driven
//! locomotion engine. Stream handlers write whenever messages arrive;
//! [`RenderController::render_tick`] reads the latest state once per frame.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     RenderController                        │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │               Context: SceneContext                   │   │
//! │  │  • now() → frame time, publish rate limiting         │   │
//! │  │  • spawn() → mesh loads                              │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │                              │                               │
//! │  ┌─────────┐ ┌──────────────────┐ ┌───────┐ ┌────────────┐  │
//! │  │   TF    │ │  VISUALIZATIONS  │ │ ROBOT │ │ LOCOMOTION │  │
//! │  │  Cache  │ │ cloud/grid/marker│ │       │ │ + publisher│  │
//! │  └─────────┘ └──────────────────┘ └───────┘ └────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Tick order
//!
//! 1. Transform cache smoothing
//! 2. Robot joints and base
//! 3. Visualization frame callbacks (mesh loads land here)
//! 4. User frame callbacks
//! 5. Locomotion gestures
//! 6. VR pose publishing
//!
//! # Usage
//!
//! ```ignore
//! use xrview_core::render_controller::RenderController;
//! use xrview_env::TokioContext;
//!
//! let mut controller = RenderController::new(ctx, transport, tf_source, loader, config);
//! controller.attach_configured_topics();
//!
//! // Once per display frame
//! let report = controller.render_tick(Some(&xr_input));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use nalgebra::Vector3;
use tracing::{debug, info, warn};
use xrview_env::{EnvError, MeshLoader, SceneContext, TopicTransport, TransformSource};

use crate::config::{TopicConfig, ViewerConfig};
use crate::layers::ground_grid_lines;
use crate::pose_publisher::VrPosePublisher;
use crate::robot::RobotFollower;
use crate::scene::SceneNode;
use crate::visualizers::{
    AttachContext, FrameCallback, FrameInfo, Visualization, VisualizationError, VisualizerRegistry,
};
use crate::xrview_locomotion::{LocomotionConfig, LocomotionEngine, LocomotionTick, XrFrameInput};
use crate::xrview_tf::TransformCache;

/// What one render tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameReport {
    pub tick: u64,
    /// Visualizations whose frame callback ran
    pub visualizations: usize,
    pub locomotion: Option<LocomotionTick>,
    pub published_poses: bool,
}

/// Owns every attached visualization and drives them frame by frame.
///
/// Generic over the context so the same controller runs in production
/// (tokio) or in the deterministic simulation.
pub struct RenderController<Ctx: SceneContext> {
    /// Environment context
    context: Arc<Ctx>,

    /// Shared bindings handed to visualizers
    attach: AttachContext<Ctx>,

    /// Message kind → visualizer
    registry: VisualizerRegistry<Ctx>,

    config: ViewerConfig,

    /// Attached visualizations by topic
    visualizations: BTreeMap<String, Visualization>,

    callbacks: Vec<FrameCallback>,

    robot: Option<RobotFollower>,

    locomotion: LocomotionEngine,

    publisher: VrPosePublisher,

    /// Current tick number
    tick_count: u64,
}

impl<Ctx: SceneContext> RenderController<Ctx> {
    /// Creates a controller with the built-in visualizers and no topics attached.
    pub fn new(
        context: Arc<Ctx>,
        transport: Arc<dyn TopicTransport>,
        transform_source: Arc<dyn TransformSource>,
        loader: Arc<dyn MeshLoader>,
        config: ViewerConfig,
    ) -> Self {
        let transforms = TransformCache::new(transform_source, config.tf.cache_config());
        let attach = AttachContext {
            context: context.clone(),
            transport,
            transforms,
            loader,
            package_base_url: config.package_base_url.clone(),
        };
        let publisher = VrPosePublisher::new(config.vr_publisher.clone(), &config.tf.fixed_frame);

        info!(
            fixed_frame = %config.tf.fixed_frame,
            topics = config.topics.len(),
            "Render controller created"
        );

        Self {
            context,
            attach,
            registry: VisualizerRegistry::with_builtins(),
            config,
            visualizations: BTreeMap::new(),
            callbacks: Vec::new(),
            robot: None,
            locomotion: LocomotionEngine::new(LocomotionConfig::default()),
            publisher,
            tick_count: 0,
        }
    }

    /// Replaces the visualizer registry (e.g. to add custom visualizers).
    pub fn with_registry(mut self, registry: VisualizerRegistry<Ctx>) -> Self {
        self.registry = registry;
        self
    }

    /// Attaches every topic from the configuration.
    ///
    /// Topics that fail are logged and skipped; the failures are returned.
    pub fn attach_configured_topics(&mut self) -> Vec<(String, VisualizationError)> {
        let topics = self.config.topics.clone();
        let mut failures = Vec::new();
        for topic in &topics {
            if let Err(e) = self.attach(topic) {
                warn!(topic = %topic.name, "Could not attach topic: {}", e);
                failures.push((topic.name.clone(), e));
            }
        }
        failures
    }

    /// Attaches one topic and returns a view of its scene node.
    ///
    /// # Returns
    /// * `Ok(SceneNode)` - Subscribed and rendering
    /// * `Err(VisualizationError::DuplicateTopic)` - Detach the topic first
    pub fn attach(&mut self, topic: &TopicConfig) -> Result<SceneNode, VisualizationError> {
        if self.visualizations.contains_key(&topic.name) {
            return Err(VisualizationError::DuplicateTopic(topic.name.clone()));
        }
        let visualization = self.registry.attach(topic, &self.attach)?;
        let node = visualization.node().clone();
        self.visualizations.insert(topic.name.clone(), visualization);
        Ok(node)
    }

    /// Detaches a topic. Returns false if it was not attached.
    pub fn detach(&mut self, topic: &str) -> bool {
        let removed = self.visualizations.remove(topic).is_some();
        if removed {
            debug!(topic = %topic, "Detached visualization");
        }
        removed
    }

    /// Registers a callback run every render tick, after the visualizations.
    pub fn on_frame(&mut self, callback: FrameCallback) {
        self.callbacks.push(callback);
    }

    /// Starts following the robot's joint states and base frame.
    pub fn attach_robot<S: AsRef<str>>(&mut self, joint_names: &[S]) -> Result<(), EnvError> {
        let follower = RobotFollower::attach(
            self.attach.transport.clone(),
            &self.attach.transforms,
            &self.config.robot,
            joint_names,
        )?;
        self.robot = Some(follower);
        Ok(())
    }

    pub fn robot(&self) -> Option<&RobotFollower> {
        self.robot.as_ref()
    }

    /// Views of all attached visualizations, ordered by topic.
    pub fn nodes(&self) -> Vec<SceneNode> {
        self.visualizations.values().map(|v| v.node().clone()).collect()
    }

    pub fn node(&self, topic: &str) -> Option<SceneNode> {
        self.visualizations.get(topic).map(|v| v.node().clone())
    }

    pub fn transforms(&self) -> &TransformCache {
        &self.attach.transforms
    }

    pub fn locomotion(&self) -> &LocomotionEngine {
        &self.locomotion
    }

    pub fn locomotion_mut(&mut self) -> &mut LocomotionEngine {
        &mut self.locomotion
    }

    pub fn publisher(&self) -> &VrPosePublisher {
        &self.publisher
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    /// Static ground grid segments in the viewer frame.
    pub fn ground_grid(&self) -> Vec<[Vector3<f64>; 2]> {
        ground_grid_lines(&self.config.grid)
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Runs one render tick.
    ///
    /// `input` is `None` outside an immersive session; locomotion and pose
    /// publishing are then skipped.
    pub fn render_tick(&mut self, input: Option<&XrFrameInput>) -> FrameReport {
        self.tick_count += 1;
        let info = FrameInfo {
            tick: self.tick_count,
            time: self.context.now(),
            viewer_scale: self.locomotion.reference().scale,
        };

        self.attach.transforms.tick();
        if let Some(robot) = &self.robot {
            robot.tick();
        }
        for visualization in self.visualizations.values_mut() {
            visualization.on_frame(&info);
        }
        for callback in &mut self.callbacks {
            callback(&info);
        }

        let mut report = FrameReport {
            tick: self.tick_count,
            visualizations: self.visualizations.len(),
            ..Default::default()
        };
        let Some(input) = input else {
            return report;
        };

        report.locomotion = Some(self.locomotion.tick(input));
        report.published_poses = match self.publisher.maybe_publish(
            info.time,
            self.context.system_time(),
            input,
            self.locomotion.reference(),
            self.attach.transport.as_ref(),
        ) {
            Ok(published) => published,
            Err(e) => {
                warn!("Pose publish failed: {}", e);
                false
            }
        };
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{lock, SceneView};
    use approx::assert_relative_eq;
    use crate::testing::LoopbackBus;
    use crate::xrview_cloud::encode_xyz;
    use crate::xrview_locomotion::{Hand, ReferenceFrame, TrackedInput};
    use async_trait::async_trait;
    use nalgebra::{Isometry3, UnitQuaternion};
    use std::sync::atomic::{AtomicU64, Ordering};
    use xrview_env::{Message, MessageKind, MeshAsset, MeshFormat, TokioContext};

    struct NoMeshes;

    #[async_trait]
    impl MeshLoader for NoMeshes {
        async fn load(&self, url: &str, _format: MeshFormat) -> Result<MeshAsset, EnvError> {
            Err(EnvError::resource(url, "offline"))
        }
    }

    fn controller(bus: &Arc<LoopbackBus>, config: ViewerConfig) -> RenderController<TokioContext> {
        RenderController::new(
            TokioContext::shared(),
            bus.clone(),
            bus.clone(),
            Arc::new(NoMeshes),
            config,
        )
    }

    fn config_with_topics() -> ViewerConfig {
        ViewerConfig {
            topics: vec![
                TopicConfig::new("/points", MessageKind::PointCloud2),
                TopicConfig::new("/map", MessageKind::OccupancyGrid),
                TopicConfig::new("/joint_states", MessageKind::JointState),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_configured_topics_attach_and_report_failures() {
        let bus = LoopbackBus::new();
        let mut rc = controller(&bus, config_with_topics());
        let failures = rc.attach_configured_topics();

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "/joint_states");
        let topics: Vec<String> = rc.nodes().into_iter().map(|n| n.topic).collect();
        assert_eq!(topics, vec!["/map".to_string(), "/points".to_string()]);

        assert!(matches!(
            rc.attach(&TopicConfig::new("/map", MessageKind::OccupancyGrid)),
            Err(VisualizationError::DuplicateTopic(_))
        ));
    }

    #[test]
    fn test_render_tick_updates_point_size_and_runs_callbacks() {
        let bus = LoopbackBus::new();
        let mut rc = controller(&bus, config_with_topics());
        rc.attach_configured_topics();

        let calls = Arc::new(AtomicU64::new(0));
        let seen = calls.clone();
        rc.on_frame(Box::new(move |info| {
            seen.store(info.tick, Ordering::SeqCst);
        }));

        bus.deliver(
            "/points",
            Message::PointCloud2(encode_xyz("lidar", &[[0.0, 0.0, 0.0]], None)),
        );
        rc.locomotion_mut().set_reference(ReferenceFrame {
            scale: 2.0,
            ..Default::default()
        });
        let report = rc.render_tick(None);
        assert_eq!(report.tick, 1);
        assert_eq!(report.visualizations, 2);
        assert!(report.locomotion.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let node = rc.node("/points").unwrap();
        let SceneView::PointCloud(weak) = node.view else {
            panic!("expected cloud");
        };
        let ring = weak.upgrade().unwrap();
        assert_relative_eq!(lock(&ring).rendered_point_size(), 0.0025, epsilon = 1e-9);
    }

    #[test]
    fn test_detach_kills_node() {
        let bus = LoopbackBus::new();
        let mut rc = controller(&bus, config_with_topics());
        rc.attach_configured_topics();
        let node = rc.node("/map").unwrap();

        assert!(rc.detach("/map"));
        assert!(!rc.detach("/map"));
        assert!(!node.is_alive());
        assert_eq!(bus.topic_subscribers("/map"), 0);
    }

    #[test]
    fn test_immersive_tick_runs_locomotion_and_publishes() {
        let bus = LoopbackBus::new();
        let mut config = ViewerConfig::default();
        config.vr_publisher.enabled = true;
        let mut rc = controller(&bus, config);

        let pointing_down = Isometry3::from_parts(
            nalgebra::Translation3::new(0.0, 1.0, 0.0),
            UnitQuaternion::from_euler_angles(-0.5, 0.0, 0.0),
        );
        let input = XrFrameInput {
            head: Isometry3::translation(0.0, 1.6, 0.0),
            controllers: [
                Some(TrackedInput::controller(pointing_down)),
                Some(TrackedInput::controller(Isometry3::translation(0.3, 1.0, 0.0))),
            ],
        };
        assert!(rc.locomotion_mut().select_start(Hand::Left, &input));

        let report = rc.render_tick(Some(&input));
        let locomotion = report.locomotion.unwrap();
        assert!(locomotion.preview.is_some());
        assert!(report.published_poses);
        assert_eq!(bus.published().len(), 3);
    }

    #[test]
    fn test_ground_grid_follows_config() {
        let bus = LoopbackBus::new();
        let rc = controller(&bus, ViewerConfig::default());
        assert_eq!(rc.ground_grid().len(), 42);
    }
}
