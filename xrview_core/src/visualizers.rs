//! Topic Visualizers - Binding message streams to scene state.
//!
//! A visualizer turns one configured topic into a [`Visualization`]: a
//! transport subscription whose handler writes into shared engine state,
//! an optional per-frame callback, and a [`SceneNode`] the renderer reads.
//!
//! # Ownership
//!
//! ```text
//!   transport ──owns──► handler ──Arc──┐
//!                                      ├──► Mutex<engine state> ◄──Weak── SceneNode
//!   Visualization ──owns──► on_frame ──┘
//! ```
//!
//! Dropping the [`Visualization`] unsubscribes, which drops the handler;
//! with both strong references gone the node stops resolving and every
//! frame tracker it held releases its transform subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};
use xrview_env::{
    EnvError, Message, MessageKind, MeshLoader, SceneContext, SubscribeOptions, TopicTransport,
};

use crate::config::{ConfigError, TopicConfig, TopicVisualizationOptions};
use crate::layers::{AxesLayer, GridLayer, PathLayer};
use crate::scene::{lock, shared, SceneNode, SceneView};
use crate::subscription::TopicSubscription;
use crate::xrview_cloud::PointCloudRing;
use crate::xrview_grid::GridRasterizer;
use crate::xrview_markers::MarkerLifecycleManager;
use crate::xrview_tf::TransformCache;

/// Default axes length for pose-like topics, in meters.
pub const DEFAULT_AXES_SIZE: f64 = 0.1;

/// Per-frame information handed to visualization callbacks.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub tick: u64,
    pub time: Duration,
    /// Uniform scale of the viewer's reference space
    pub viewer_scale: f64,
}

/// Work a visualization does once per render tick.
pub type FrameCallback = Box<dyn FnMut(&FrameInfo) + Send>;

#[derive(Debug, Error)]
pub enum VisualizationError {
    #[error("No visualizer for message type '{0}'")]
    UnsupportedMessageType(String),

    #[error("Topic '{0}' is already attached")]
    DuplicateTopic(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Subscription failed: {0}")]
    Transport(#[from] EnvError),
}

/// Everything a visualizer may bind to when attaching.
pub struct AttachContext<Ctx: SceneContext> {
    pub context: Arc<Ctx>,
    pub transport: Arc<dyn TopicTransport>,
    pub transforms: TransformCache,
    pub loader: Arc<dyn MeshLoader>,
    pub package_base_url: String,
}

/// One attached topic.
pub struct Visualization {
    node: SceneNode,
    subscription: TopicSubscription,
    frame_callback: Option<FrameCallback>,
}

impl Visualization {
    pub fn new(
        node: SceneNode,
        subscription: TopicSubscription,
        frame_callback: Option<FrameCallback>,
    ) -> Self {
        Self {
            node,
            subscription,
            frame_callback,
        }
    }

    pub fn node(&self) -> &SceneNode {
        &self.node
    }

    pub fn topic(&self) -> &str {
        self.subscription.topic()
    }

    pub fn is_active(&self) -> bool {
        self.subscription.is_active()
    }

    /// Runs the per-frame callback, if any.
    pub fn on_frame(&mut self, info: &FrameInfo) {
        if let Some(callback) = self.frame_callback.as_mut() {
            callback(info);
        }
    }
}

impl std::fmt::Debug for Visualization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Visualization")
            .field("node", &self.node)
            .field("subscription", &self.subscription)
            .finish()
    }
}

/// Builds visualizations for one message kind.
pub trait TopicVisualizer<Ctx: SceneContext>: Send + Sync {
    fn kind(&self) -> MessageKind;

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError>;
}

fn unexpected(topic: &str, expected: MessageKind, msg: &Message) {
    warn!(topic = %topic, expected = %expected, actual = %msg.kind(), "Ignoring message of wrong type");
}

// ============================================================================
// BUILT-INS
// ============================================================================

pub struct PointCloudVisualizer;

impl<Ctx: SceneContext> TopicVisualizer<Ctx> for PointCloudVisualizer {
    fn kind(&self) -> MessageKind {
        MessageKind::PointCloud2
    }

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError> {
        let ring = shared(PointCloudRing::new(options.point_cloud()));
        let node = SceneNode::new(
            topic,
            MessageKind::PointCloud2,
            SceneView::PointCloud(Arc::downgrade(&ring)),
        );

        let handler_ring = ring.clone();
        let mut tracker = ctx.transforms.resolve_pose("");
        let name = topic.to_string();
        let subscription = TopicSubscription::subscribe(
            ctx.transport.clone(),
            topic,
            MessageKind::PointCloud2,
            SubscribeOptions::sensor_stream(),
            Box::new(move |msg| match msg {
                Message::PointCloud2(cloud) => {
                    tracker.track(&cloud.header.frame_id);
                    // Decode errors are already logged by the ring
                    let _ = lock(&handler_ring).ingest(cloud, tracker.pose());
                }
                other => unexpected(&name, MessageKind::PointCloud2, other),
            }),
        )?;

        let on_frame: FrameCallback = Box::new(move |info| {
            lock(&ring).update_point_size(info.viewer_scale);
        });
        Ok(Visualization::new(node, subscription, Some(on_frame)))
    }
}

pub struct OccupancyGridVisualizer;

impl<Ctx: SceneContext> TopicVisualizer<Ctx> for OccupancyGridVisualizer {
    fn kind(&self) -> MessageKind {
        MessageKind::OccupancyGrid
    }

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError> {
        let layer = shared(GridLayer::new(
            GridRasterizer::new(options.grid()),
            ctx.transforms.resolve_pose(""),
        ));
        let node = SceneNode::new(
            topic,
            MessageKind::OccupancyGrid,
            SceneView::Grid(Arc::downgrade(&layer)),
        );

        let handler_layer = layer.clone();
        let name = topic.to_string();
        let subscription = TopicSubscription::subscribe(
            ctx.transport.clone(),
            topic,
            MessageKind::OccupancyGrid,
            SubscribeOptions::default(),
            Box::new(move |msg| match msg {
                Message::OccupancyGrid(grid) => lock(&handler_layer).on_grid(grid),
                other => unexpected(&name, MessageKind::OccupancyGrid, other),
            }),
        )?;

        let on_frame: FrameCallback = Box::new(move |_| lock(&layer).on_frame());
        Ok(Visualization::new(node, subscription, Some(on_frame)))
    }
}

pub struct MarkerVisualizer;

impl<Ctx: SceneContext> TopicVisualizer<Ctx> for MarkerVisualizer {
    fn kind(&self) -> MessageKind {
        MessageKind::Marker
    }

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        _options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError> {
        let manager = Arc::new(MarkerLifecycleManager::new(
            ctx.context.clone(),
            ctx.loader.clone(),
            &ctx.package_base_url,
        ));
        let node = SceneNode::new(
            topic,
            MessageKind::Marker,
            SceneView::Markers(Arc::downgrade(&manager.registry())),
        );

        let handler_manager = manager.clone();
        let name = topic.to_string();
        let subscription = TopicSubscription::subscribe(
            ctx.transport.clone(),
            topic,
            MessageKind::Marker,
            SubscribeOptions::default(),
            Box::new(move |msg| match msg {
                Message::Marker(marker) => {
                    if let Err(e) = handler_manager.apply(marker) {
                        warn!(topic = %name, "Ignoring marker: {}", e);
                    }
                }
                other => unexpected(&name, MessageKind::Marker, other),
            }),
        )?;

        let on_frame: FrameCallback = Box::new(move |_| {
            let landed = manager.poll_loads();
            if landed > 0 {
                debug!(landed, "Mesh loads applied");
            }
        });
        Ok(Visualization::new(node, subscription, Some(on_frame)))
    }
}

/// Axes for `PoseStamped` or `Odometry` topics.
pub struct AxesVisualizer {
    kind: MessageKind,
}

impl AxesVisualizer {
    pub fn pose() -> Self {
        Self {
            kind: MessageKind::PoseStamped,
        }
    }

    pub fn odometry() -> Self {
        Self {
            kind: MessageKind::Odometry,
        }
    }
}

impl<Ctx: SceneContext> TopicVisualizer<Ctx> for AxesVisualizer {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError> {
        let layer = shared(AxesLayer::new(
            ctx.transforms.resolve_pose(""),
            options.axes_size.unwrap_or(DEFAULT_AXES_SIZE),
        ));
        let node = SceneNode::new(topic, self.kind, SceneView::Axes(Arc::downgrade(&layer)));

        let handler_layer = layer.clone();
        let kind = self.kind;
        let name = topic.to_string();
        let subscription = TopicSubscription::subscribe(
            ctx.transport.clone(),
            topic,
            kind,
            SubscribeOptions::default(),
            Box::new(move |msg| match msg {
                Message::PoseStamped(p) if kind == MessageKind::PoseStamped => {
                    lock(&handler_layer).on_pose(&p.header.frame_id, &p.pose)
                }
                Message::Odometry(o) if kind == MessageKind::Odometry => {
                    lock(&handler_layer).on_pose(&o.header.frame_id, &o.pose.pose)
                }
                other => unexpected(&name, kind, other),
            }),
        )?;

        let on_frame: FrameCallback = Box::new(move |_| lock(&layer).on_frame());
        Ok(Visualization::new(node, subscription, Some(on_frame)))
    }
}

pub struct PathVisualizer;

impl<Ctx: SceneContext> TopicVisualizer<Ctx> for PathVisualizer {
    fn kind(&self) -> MessageKind {
        MessageKind::Path
    }

    fn attach(
        &self,
        topic: &str,
        ctx: &AttachContext<Ctx>,
        _options: &TopicVisualizationOptions,
    ) -> Result<Visualization, VisualizationError> {
        let layer = shared(PathLayer::new(ctx.transforms.resolve_pose("")));
        let node = SceneNode::new(topic, MessageKind::Path, SceneView::Path(Arc::downgrade(&layer)));

        let handler_layer = layer.clone();
        let name = topic.to_string();
        let subscription = TopicSubscription::subscribe(
            ctx.transport.clone(),
            topic,
            MessageKind::Path,
            SubscribeOptions::default(),
            Box::new(move |msg| match msg {
                Message::Path(path) => lock(&handler_layer).on_path(path),
                other => unexpected(&name, MessageKind::Path, other),
            }),
        )?;

        let on_frame: FrameCallback = Box::new(move |_| lock(&layer).on_frame());
        Ok(Visualization::new(node, subscription, Some(on_frame)))
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Message kind to visualizer lookup.
pub struct VisualizerRegistry<Ctx: SceneContext> {
    visualizers: HashMap<MessageKind, Box<dyn TopicVisualizer<Ctx>>>,
}

impl<Ctx: SceneContext> VisualizerRegistry<Ctx> {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            visualizers: HashMap::new(),
        }
    }

    /// Registry with a visualizer for every renderable message kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(PointCloudVisualizer));
        registry.register(Box::new(OccupancyGridVisualizer));
        registry.register(Box::new(MarkerVisualizer));
        registry.register(Box::new(AxesVisualizer::pose()));
        registry.register(Box::new(AxesVisualizer::odometry()));
        registry.register(Box::new(PathVisualizer));
        registry
    }

    /// Adds or replaces the visualizer for its message kind.
    pub fn register(&mut self, visualizer: Box<dyn TopicVisualizer<Ctx>>) {
        self.visualizers.insert(visualizer.kind(), visualizer);
    }

    pub fn supports(&self, kind: MessageKind) -> bool {
        self.visualizers.contains_key(&kind)
    }

    /// Registered kinds, in declaration order.
    pub fn kinds(&self) -> Vec<MessageKind> {
        MessageKind::all()
            .into_iter()
            .filter(|k| self.supports(*k))
            .collect()
    }

    /// Attaches a configured topic.
    ///
    /// # Returns
    /// * `Err(VisualizationError::Config)` - Unparseable message type
    /// * `Err(VisualizationError::UnsupportedMessageType)` - Nothing renders this kind
    /// * `Err(VisualizationError::Transport)` - The subscription was refused
    pub fn attach(
        &self,
        topic: &TopicConfig,
        ctx: &AttachContext<Ctx>,
    ) -> Result<Visualization, VisualizationError> {
        let kind = topic.kind()?;
        let visualizer = self
            .visualizers
            .get(&kind)
            .ok_or_else(|| VisualizationError::UnsupportedMessageType(topic.message_type.clone()))?;
        let visualization = visualizer.attach(&topic.name, ctx, &topic.options)?;
        debug!(topic = %topic.name, kind = %kind, "Attached visualization");
        Ok(visualization)
    }
}

impl<Ctx: SceneContext> Default for VisualizerRegistry<Ctx> {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackBus;
    use crate::xrview_cloud::encode_xyz;
    use crate::xrview_tf::TransformCacheConfig;
    use async_trait::async_trait;
    use nalgebra::{Isometry3, Vector3};
    use xrview_env::msgs::{Header, MapMetaData, OccupancyGrid, PoseStamped};
    use xrview_env::{MeshAsset, MeshFormat, TokioContext};

    struct NoMeshes;

    #[async_trait]
    impl MeshLoader for NoMeshes {
        async fn load(&self, url: &str, _format: MeshFormat) -> Result<MeshAsset, EnvError> {
            Err(EnvError::resource(url, "offline"))
        }
    }

    fn attach_context(bus: &Arc<LoopbackBus>) -> AttachContext<TokioContext> {
        AttachContext {
            context: TokioContext::shared(),
            transport: bus.clone(),
            transforms: TransformCache::new(bus.clone(), TransformCacheConfig::default()),
            loader: Arc::new(NoMeshes),
            package_base_url: "https://localhost:8080".to_string(),
        }
    }

    #[test]
    fn test_point_cloud_uses_origin_pose_at_ingest() {
        let bus = LoopbackBus::new();
        bus.set_transform("lidar", Isometry3::translation(1.0, 0.0, 0.0));
        let ctx = attach_context(&bus);
        let registry = VisualizerRegistry::<TokioContext>::with_builtins();
        let vis = registry
            .attach(&TopicConfig::new("/points", MessageKind::PointCloud2), &ctx)
            .unwrap();

        let cloud = encode_xyz("lidar", &[[0.0, 0.0, 1.0], [1.0, 1.0, 1.0]], None);
        assert_eq!(bus.deliver("/points", Message::PointCloud2(cloud)), 1);

        let SceneView::PointCloud(weak) = &vis.node().view else {
            panic!("expected point cloud view");
        };
        let ring = weak.upgrade().unwrap();
        let ring = lock(&ring);
        let slot = ring.visible_slots().next().unwrap();
        assert_eq!(slot.draw_count(), 2);
        assert_eq!(slot.origin_frame(), "lidar");
        assert_eq!(slot.origin_pose().translation.vector, Vector3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_detach_releases_everything() {
        let bus = LoopbackBus::new();
        let ctx = attach_context(&bus);
        let registry = VisualizerRegistry::<TokioContext>::with_builtins();
        let vis = registry
            .attach(&TopicConfig::new("/map", MessageKind::OccupancyGrid), &ctx)
            .unwrap();

        let mut grid = OccupancyGrid {
            header: Header::new("odom"),
            info: MapMetaData {
                resolution: 0.5,
                width: 2,
                height: 2,
                ..Default::default()
            },
            data: vec![0, 100, -1, 50],
        };
        bus.deliver("/map", Message::OccupancyGrid(grid.clone()));
        grid.header.frame_id = "map".to_string();
        bus.deliver("/map", Message::OccupancyGrid(grid));
        assert_eq!(ctx.transforms.frame_names(), vec!["map".to_string()]);
        assert_eq!(bus.topic_subscribers("/map"), 1);

        let node = vis.node().clone();
        drop(vis);
        assert!(!node.is_alive());
        assert_eq!(bus.topic_subscribers("/map"), 0);
        assert_eq!(ctx.transforms.frame_count(), 0);
        assert_eq!(bus.frame_subscribers(), 0);
    }

    #[test]
    fn test_oversized_grid_keeps_previous_texture() {
        let bus = LoopbackBus::new();
        let ctx = attach_context(&bus);
        let registry = VisualizerRegistry::<TokioContext>::with_builtins();
        let vis = registry
            .attach(&TopicConfig::new("/map", MessageKind::OccupancyGrid), &ctx)
            .unwrap();

        let mut grid = OccupancyGrid {
            header: Header::new("map"),
            info: MapMetaData {
                resolution: 0.5,
                width: 2,
                height: 2,
                ..Default::default()
            },
            data: vec![0, 100, -1, 50],
        };
        bus.deliver("/map", Message::OccupancyGrid(grid.clone()));
        grid.info.width = u32::MAX;
        grid.info.height = u32::MAX;
        bus.deliver("/map", Message::OccupancyGrid(grid));

        let SceneView::Grid(weak) = &vis.node().view else {
            panic!("expected grid view");
        };
        let layer = weak.upgrade().unwrap();
        let layer = lock(&layer);
        assert_eq!(layer.updates(), 1);
        let texture = layer.texture().unwrap();
        assert_eq!((texture.width, texture.height), (2, 2));
    }

    #[test]
    fn test_pose_axes_follow_smoothed_target() {
        let bus = LoopbackBus::new();
        let ctx = attach_context(&bus);
        let registry = VisualizerRegistry::<TokioContext>::with_builtins();
        let mut vis = registry
            .attach(&TopicConfig::new("/goal", MessageKind::PoseStamped), &ctx)
            .unwrap();

        let mut goal = PoseStamped {
            header: Header::new("map"),
            ..Default::default()
        };
        goal.pose.position.x = 2.0;
        bus.deliver("/goal", Message::PoseStamped(goal));

        let info = FrameInfo {
            tick: 1,
            time: Duration::ZERO,
            viewer_scale: 1.0,
        };
        // First observation snaps, later ticks hold
        vis.on_frame(&info);
        let SceneView::Axes(weak) = &vis.node().view else {
            panic!("expected axes view");
        };
        let layer = weak.upgrade().unwrap();
        assert_eq!(lock(&layer).local_pose().translation.vector.x, 2.0);
        assert_eq!(lock(&layer).axes_size, DEFAULT_AXES_SIZE);
    }

    #[test]
    fn test_unsupported_and_unknown_types() {
        let bus = LoopbackBus::new();
        let ctx = attach_context(&bus);
        let registry = VisualizerRegistry::<TokioContext>::with_builtins();

        let joints = TopicConfig::new("/joint_states", MessageKind::JointState);
        assert!(matches!(
            registry.attach(&joints, &ctx),
            Err(VisualizationError::UnsupportedMessageType(_))
        ));

        let mut bogus = TopicConfig::new("/x", MessageKind::Path);
        bogus.message_type = "std_msgs/String".to_string();
        assert!(matches!(
            registry.attach(&bogus, &ctx),
            Err(VisualizationError::Config(_))
        ));
        assert_eq!(registry.kinds().len(), 6);
    }
}
