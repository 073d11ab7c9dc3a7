//! Scenario runner - drives the full viewer stack against the oracle.
//!
//! Every scenario uses the same tick:
//!
//! ```text
//! oracle.step ─► clock.advance ─► set_transform(frames) ─► inject(streams)
//!      ─► bus.flush (handlers run) ─► run_spawned (mesh loads) ─► render_tick
//! ```

use std::f64::consts::FRAC_PI_6;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::Serialize;
use tracing::{debug, info, warn};
use xrview_core::config::TopicConfig;
use xrview_core::pose::translation_distance;
use xrview_core::scene::{lock, SceneView};
use xrview_core::xrview_grid::{cell_color, GridOptions, UNKNOWN_CELL};
use xrview_core::xrview_locomotion::{GuidePreview, Hand, LocomotionConfig, TrackedInput, XrFrameInput};
use xrview_core::xrview_markers::{resolve_resource, MarkerKey};
use xrview_core::{
    FrameReport, MarkerRegistry, PointCloudOptions, PointCloudRing, RenderController, ViewerConfig,
};
use xrview_core::layers::GridLayer;
use xrview_env::{Message, MessageKind, SceneContext};

use crate::context::SimContext;
use crate::exporter::{PointSample, SimEvent, SimExport, SimFrame, ViewerSample};
use crate::loader::SimMeshLoader;
use crate::network::SimBus;
use crate::oracle::{OracleConfig, RobotOracle, BASE_FRAME, LIDAR_FRAME, MARKER_NS};
use crate::scenarios::ScenarioId;

const CLOUD_TOPIC: &str = "/lidar/points";
const MAP_TOPIC: &str = "/map";
const MARKER_TOPIC: &str = "/markers";

/// How far the hands twist during grab navigation (radians).
const GRAB_TWIST: f64 = 0.5;

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total render ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Topic messages that reached a handler
    pub messages_delivered: u64,

    /// Topic messages lost to injected drops
    pub messages_dropped: u64,

    /// Topic messages superseded in a depth-1 queue
    pub messages_overwritten: u64,

    pub transforms_delivered: u64,

    pub clouds_decoded: u64,

    /// Marker entries at the end of the run
    pub markers_live: usize,

    /// Mesh loads the loader served
    pub mesh_loads: u64,

    /// Mesh loads that landed after their entity was gone
    pub stale_discarded: u64,

    pub teleports: u64,

    /// Rendered-vs-true base distance at the end of the run (m)
    pub pose_error: f64,

    pub viewer_scale: f64,
}

/// Collected assertion failures.
#[derive(Debug, Default)]
struct Checks(Vec<String>);

impl Checks {
    fn require(&mut self, ok: bool, failure: impl FnOnce() -> String) {
        if !ok {
            let reason = failure();
            warn!("Check failed: {}", reason);
            self.0.push(reason);
        }
    }

    fn reason(&self) -> Option<String> {
        (!self.0.is_empty()).then(|| self.0.join("; "))
    }
}

/// What a scenario hands back to the runner.
struct Outcome {
    checks: Checks,
    metrics: ScenarioMetrics,
    ticks: u64,
    time_secs: f64,
}

// ============================================================================
// RIG
// ============================================================================

/// One viewer wired to one simulated robot.
struct Rig {
    context: SimContext,
    bus: Arc<SimBus>,
    loader: Arc<SimMeshLoader>,
    controller: RenderController<SimContext>,
    oracle: RobotOracle,
    dt: f64,
    ticks: u64,
}

impl Rig {
    fn new(seed: u64, config: ViewerConfig, tick_rate_hz: u32) -> Self {
        // Physics gets its own stream so bus faults never change the robot
        let physics_seed = seed.wrapping_mul(0x9e3779b97f4a7c15);

        let context = SimContext::new(seed);
        let bus = SimBus::new(context.clone(), config.tf.fixed_frame.clone());
        let loader = Arc::new(SimMeshLoader::new());
        let controller = RenderController::new(
            Arc::new(context.clone()),
            bus.clone(),
            bus.clone(),
            loader.clone(),
            config,
        );

        Self {
            context,
            bus,
            loader,
            controller,
            oracle: RobotOracle::new(physics_seed, OracleConfig::default()),
            dt: 1.0 / tick_rate_hz.max(1) as f64,
            ticks: 0,
        }
    }

    /// Moves the world forward one tick and publishes the robot's frames.
    fn advance(&mut self) {
        self.oracle.step(self.dt);
        self.context.advance_time(Duration::from_secs_f64(self.dt));
        for (frame, pose) in self.oracle.frames() {
            self.bus.set_transform(frame, &pose);
        }
    }

    fn inject(&self, topic: &str, message: Message) {
        self.bus.inject(topic, message);
    }

    fn flush(&self) -> usize {
        self.bus.flush()
    }

    /// Runs every spawned task (mesh loads) to completion.
    async fn drain(&self) -> usize {
        self.context.run_spawned().await
    }

    fn render(&mut self, input: Option<&XrFrameInput>) -> FrameReport {
        self.ticks += 1;
        self.controller.render_tick(input)
    }

    fn cloud_ring(&self, topic: &str) -> Option<Arc<Mutex<PointCloudRing>>> {
        match self.controller.node(topic)?.view {
            SceneView::PointCloud(weak) => weak.upgrade(),
            _ => None,
        }
    }

    fn marker_registry(&self, topic: &str) -> Option<Arc<Mutex<MarkerRegistry>>> {
        match self.controller.node(topic)?.view {
            SceneView::Markers(weak) => weak.upgrade(),
            _ => None,
        }
    }

    fn grid_layer(&self, topic: &str) -> Option<Arc<Mutex<GridLayer>>> {
        match self.controller.node(topic)?.view {
            SceneView::Grid(weak) => weak.upgrade(),
            _ => None,
        }
    }

    fn time_secs(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    /// Fills the counters every scenario reports.
    fn metrics(&self) -> ScenarioMetrics {
        let bus = self.bus.stats();
        let reference = self.controller.locomotion().reference();
        ScenarioMetrics {
            messages_delivered: bus.delivered,
            messages_dropped: bus.dropped,
            messages_overwritten: bus.overwritten,
            transforms_delivered: bus.transforms_delivered,
            mesh_loads: self.loader.loads(),
            teleports: self.controller.locomotion().teleports(),
            viewer_scale: reference.scale,
            ..Default::default()
        }
    }

    fn frame(&self, events: Vec<SimEvent>) -> SimFrame {
        let mut visible_points = 0;
        let mut markers = 0;
        for node in self.controller.nodes() {
            match &node.view {
                SceneView::PointCloud(weak) => {
                    if let Some(ring) = weak.upgrade() {
                        visible_points += lock(&ring).visible_points();
                    }
                }
                SceneView::Markers(weak) => {
                    if let Some(registry) = weak.upgrade() {
                        markers += lock(&registry).len();
                    }
                }
                _ => {}
            }
        }
        let reference = self.controller.locomotion().reference();
        SimFrame {
            time_sec: self.time_secs(),
            tick: self.ticks,
            base_truth: PointSample::new(&self.oracle.base_pose().translation.vector),
            base_rendered: self
                .controller
                .transforms()
                .lookup(BASE_FRAME)
                .map(|pose| PointSample::new(&pose.translation.vector)),
            visible_points,
            markers,
            viewer: ViewerSample {
                position: PointSample::new(&reference.position),
                yaw: reference.yaw(),
                scale: reference.scale,
            },
            events,
        }
    }

    fn outcome(&self, checks: Checks, metrics: ScenarioMetrics) -> Outcome {
        Outcome {
            checks,
            metrics,
            ticks: self.ticks,
            time_secs: self.time_secs(),
        }
    }
}

/// Samples frames into an optional export.
struct Recorder {
    every: u64,
    export: Option<SimExport>,
    events: Vec<SimEvent>,
}

impl Recorder {
    fn disabled() -> Self {
        Self {
            every: 1,
            export: None,
            events: Vec::new(),
        }
    }

    fn event(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        if self.export.is_some() {
            self.events.push(SimEvent::info(message));
        }
    }

    fn capture(&mut self, rig: &Rig) {
        let Some(export) = self.export.as_mut() else {
            return;
        };
        if rig.ticks % self.every == 0 || !self.events.is_empty() {
            export.add_frame(rig.frame(std::mem::take(&mut self.events)));
        }
    }
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs stream-to-scene scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Duration in seconds
    duration_secs: f64,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            tick_rate_hz: 30,
            duration_secs: 10.0,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.duration_secs = secs;
        self
    }

    fn target_ticks(&self) -> u64 {
        ((self.duration_secs * self.tick_rate_hz as f64).round() as u64).max(2)
    }

    /// Runs a scenario and returns the result.
    pub async fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.execute(scenario, &mut Recorder::disabled()).await
    }

    /// Runs a scenario while sampling every `every`-th tick into an export.
    pub async fn run_with_export(&self, scenario: ScenarioId, every: u64) -> (ScenarioResult, SimExport) {
        let mut recorder = Recorder {
            every: every.max(1),
            export: Some(SimExport::new(scenario.name(), self.seed)),
            events: Vec::new(),
        };
        let result = self.execute(scenario, &mut recorder).await;
        let mut export = recorder
            .export
            .unwrap_or_else(|| SimExport::new(scenario.name(), self.seed));
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    async fn execute(&self, scenario: ScenarioId, recorder: &mut Recorder) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let outcome = match scenario {
            ScenarioId::SmoothFollow => self.run_smooth_follow(recorder).await,
            ScenarioId::CloudFlood => self.run_cloud_flood(recorder).await,
            ScenarioId::MarkerChurn => self.run_marker_churn(recorder).await,
            ScenarioId::GuidedTeleport => self.run_guided_teleport(recorder).await,
            ScenarioId::GrabNavigate => self.run_grab_navigate(recorder).await,
            ScenarioId::GridStream => self.run_grid_stream(recorder).await,
        };

        let failure_reason = outcome.checks.reason();
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            total_ticks: outcome.ticks,
            final_time_secs: outcome.time_secs,
            failure_reason,
            metrics: outcome.metrics,
        }
    }

    /// XRS-001: SmoothFollow - frame smoothing and subscription release.
    ///
    /// The base drives a circle with joints waving, then halts at 70% of the
    /// run. A point cloud topic tracks the lidar frame throughout.
    /// **Assertion**: rendered base pose and joint angles converge onto the
    /// truth; detaching the cloud topic releases its topic and frame.
    async fn run_smooth_follow(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-001: SmoothFollow - frame smoothing and release");

        let mut config = ViewerConfig::default();
        config.topics.push(TopicConfig::new(CLOUD_TOPIC, MessageKind::PointCloud2));
        let joint_topic = config.robot.joint_states_topics[0].clone();

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();

        let failures = rig.controller.attach_configured_topics();
        checks.require(failures.is_empty(), || format!("{} topics failed to attach", failures.len()));
        let joints = rig.oracle.config().joint_names.clone();
        if let Err(e) = rig.controller.attach_robot(joints.as_slice()) {
            checks.require(false, || format!("robot attach failed: {}", e));
        }

        let ticks = self.target_ticks();
        let halt_at = ticks * 7 / 10;
        for tick in 0..ticks {
            if tick == halt_at {
                rig.oracle.halt();
                recorder.event(format!("Robot halted at t={:.2}s", rig.oracle.time()));
            }
            rig.advance();
            rig.inject(&joint_topic, Message::JointState(rig.oracle.joint_state()));
            if tick % 3 == 0 {
                let cloud = rig.oracle.point_cloud();
                rig.inject(CLOUD_TOPIC, Message::PointCloud2(cloud));
            }
            rig.flush();
            rig.drain().await;
            rig.render(None);
            recorder.capture(&rig);

            if tick % 30 == 0 {
                debug!(
                    "  t={:.1}s | frames={} | delivered={}",
                    rig.oracle.time(),
                    rig.controller.transforms().frame_count(),
                    rig.bus.stats().delivered
                );
            }
        }

        let mut metrics = rig.metrics();
        match rig.controller.robot() {
            Some(robot) => {
                let model = robot.model();
                let model = lock(&model);
                metrics.pose_error = translation_distance(&model.base_pose(), &rig.oracle.base_pose());
                checks.require(metrics.pose_error < 0.02, || {
                    format!("base pose error {:.4}m did not converge", metrics.pose_error)
                });
                for (i, name) in joints.iter().enumerate() {
                    let rendered = model.joint(name).unwrap_or(f64::NAN);
                    let error = (rendered - rig.oracle.joint_angle(i)).abs();
                    checks.require(error < 1e-3, || format!("joint {} off by {:.4}rad", name, error));
                }
            }
            None => checks.require(false, || "robot follower missing".to_string()),
        }

        let node = rig.controller.node(CLOUD_TOPIC);
        let subscribed = rig.bus.topic_subscribers(CLOUD_TOPIC);
        let lidar_consumers = rig.controller.transforms().consumers(LIDAR_FRAME);
        rig.controller.detach(CLOUD_TOPIC);
        checks.require(subscribed == 1 && lidar_consumers == 1, || {
            format!("expected one cloud subscription and lidar consumer, got {} / {}", subscribed, lidar_consumers)
        });
        checks.require(rig.bus.topic_subscribers(CLOUD_TOPIC) == 0, || {
            "cloud topic still subscribed after detach".to_string()
        });
        checks.require(rig.controller.transforms().consumers(LIDAR_FRAME) == 0, || {
            "lidar frame still tracked after detach".to_string()
        });
        checks.require(node.map(|n| !n.is_alive()).unwrap_or(false), || {
            "cloud scene node outlived its visualization".to_string()
        });

        rig.outcome(checks, metrics)
    }

    /// XRS-002: CloudFlood - a scan every tick behind a 100ms throttle.
    ///
    /// **Assertion**: every delivered scan lands in the 3-slot ring in order,
    /// superseded scans are never seen, and slots hold whole scans.
    async fn run_cloud_flood(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-002: CloudFlood - throttled point cloud ring");

        let mut topic = TopicConfig::new(CLOUD_TOPIC, MessageKind::PointCloud2);
        topic.options.max_traces = Some(3);
        let mut config = ViewerConfig::default();
        config.topics.push(topic);

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();
        let failures = rig.controller.attach_configured_topics();
        checks.require(failures.is_empty(), || format!("{} topics failed to attach", failures.len()));

        let ticks = self.target_ticks();
        for _ in 0..ticks {
            rig.advance();
            let cloud = rig.oracle.point_cloud();
            rig.inject(CLOUD_TOPIC, Message::PointCloud2(cloud));
            rig.flush();
            rig.render(None);
            recorder.capture(&rig);
        }

        let mut metrics = rig.metrics();
        let Some(ring) = rig.cloud_ring(CLOUD_TOPIC) else {
            checks.require(false, || "cloud ring missing".to_string());
            return rig.outcome(checks, metrics);
        };
        let ring = lock(&ring);
        metrics.clouds_decoded = ring.decoded();

        let scan = rig.oracle.config().cloud_points;
        let handled = ring.decoded() + ring.skipped();
        checks.require(handled == metrics.messages_delivered, || {
            format!("{} scans delivered but {} handled", metrics.messages_delivered, handled)
        });
        checks.require(ring.decoded() > 0, || "no scan decoded".to_string());
        checks.require(metrics.messages_overwritten > 0, || {
            "throttle never superseded a scan".to_string()
        });

        let visible: Vec<usize> = ring.visible_slots().map(|s| s.draw_count()).collect();
        let expected_visible = (ring.decoded() as usize).min(ring.slot_count());
        checks.require(visible.len() == expected_visible, || {
            format!("{} visible slots, expected {}", visible.len(), expected_visible)
        });
        checks.require(visible.iter().all(|&n| n == scan), || {
            format!("partial scans visible: {:?}", visible)
        });
        checks.require(ring.cursor() == ring.decoded() as usize % ring.slot_count(), || {
            format!("cursor {} after {} decodes", ring.cursor(), ring.decoded())
        });
        checks.require(ring.visible_slots().all(|s| s.origin_frame() == LIDAR_FRAME), || {
            "slot origin frame is not the lidar".to_string()
        });

        drop(ring);
        rig.outcome(checks, metrics)
    }

    /// XRS-003: MarkerChurn - lifecycle under racing mesh loads.
    ///
    /// Mesh loads only complete every fifth tick, and a DELETEALL lands just
    /// before one of those drains, so some loads finish for entities that
    /// no longer exist. One mesh URL is made to fail.
    /// **Assertion**: the registry ends up with exactly the oracle's live
    /// markers, nothing pending, and stale loads discarded.
    async fn run_marker_churn(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-003: MarkerChurn - lifecycle under racing loads");

        let mut config = ViewerConfig::default();
        config.topics.push(TopicConfig::new(MARKER_TOPIC, MessageKind::Marker));
        let broken = resolve_resource(&RobotOracle::mesh_resource(3), &config.package_base_url);

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();
        let failures = rig.controller.attach_configured_topics();
        checks.require(failures.is_empty(), || format!("{} topics failed to attach", failures.len()));
        rig.loader.fail_url(broken);

        let ticks = self.target_ticks();
        let mark = ticks * 6 / 10;
        let delete_all_at = (mark >= 4).then(|| mark - (mark + 1) % 5);

        for tick in 0..ticks {
            rig.advance();
            for marker in rig.oracle.marker_churn() {
                rig.inject(MARKER_TOPIC, Message::Marker(marker));
            }
            if delete_all_at == Some(tick) {
                let clear = rig.oracle.delete_all_markers();
                rig.inject(MARKER_TOPIC, Message::Marker(clear));
                recorder.event(format!("DELETEALL at tick {}", tick));
            }
            rig.flush();
            if tick % 5 == 4 {
                let landed = rig.drain().await;
                debug!(tick, landed, "Drained mesh loads");
            }
            rig.render(None);
            recorder.capture(&rig);
        }

        // Let the last loads land, then one more frame to apply them
        rig.drain().await;
        rig.render(None);

        let mut metrics = rig.metrics();
        let Some(registry) = rig.marker_registry(MARKER_TOPIC) else {
            checks.require(false, || "marker registry missing".to_string());
            return rig.outcome(checks, metrics);
        };
        let registry = lock(&registry);
        let stats = registry.stats();
        metrics.markers_live = registry.len();
        metrics.stale_discarded = stats.stale_discarded;

        checks.require(registry.pending_count() == 0, || {
            format!("{} markers still pending", registry.pending_count())
        });
        checks.require(registry.len() == rig.oracle.live_marker_count(), || {
            format!(
                "registry holds {} markers, oracle {}",
                registry.len(),
                rig.oracle.live_marker_count()
            )
        });
        let missing: Vec<i32> = rig
            .oracle
            .live_marker_ids()
            .filter(|id| !registry.contains(&MarkerKey::new(MARKER_NS, *id)))
            .collect();
        checks.require(missing.is_empty(), || format!("markers missing: {:?}", missing));
        checks.require(stats.loads_started == rig.loader.loads(), || {
            format!("{} loads started, {} served", stats.loads_started, rig.loader.loads())
        });
        if delete_all_at.is_some() {
            checks.require(stats.stale_discarded > 0, || {
                "DELETEALL raced no mesh load".to_string()
            });
        }

        drop(registry);
        rig.outcome(checks, metrics)
    }

    /// XRS-004: GuidedTeleport - arc preview and teleport on release.
    ///
    /// **Assertion**: the preview is drawn while guiding, the release puts
    /// the viewer's feet on the previewed landing, articulated hands cannot
    /// guide, and headset/controller poses are published back.
    async fn run_guided_teleport(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-004: GuidedTeleport - ballistic guide and teleport");

        let mut config = ViewerConfig::default();
        config.vr_publisher.enabled = true;
        let publisher = config.vr_publisher.clone();

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();

        let input = guide_input(false);
        let tracked_hands = guide_input(true);
        checks.require(!rig.controller.locomotion_mut().select_start(Hand::Left, &tracked_hands), || {
            "articulated hand started a guide".to_string()
        });
        checks.require(rig.controller.locomotion_mut().select_start(Hand::Right, &input), || {
            "controller could not start a guide".to_string()
        });

        let ticks = self.target_ticks();
        let release_at = ticks / 2;
        let mut last_preview: Option<GuidePreview> = None;
        let mut landing_error = f64::INFINITY;
        let mut preview_after_release = false;

        for tick in 0..ticks {
            rig.advance();
            rig.flush();
            if tick == release_at {
                match rig.controller.locomotion_mut().select_end(Hand::Right, &input) {
                    Some(offset) => {
                        recorder.event(format!("Teleported by ({:.2}, {:.2}, {:.2})", offset.x, offset.y, offset.z));
                        let reference = rig.controller.locomotion().reference();
                        let mut feet = reference.to_world(&input.head.translation.vector);
                        feet.y = reference.floor_y();
                        if let Some(preview) = &last_preview {
                            landing_error = (feet - preview.landing).norm();
                        }
                    }
                    None => checks.require(false, || "guide release did not teleport".to_string()),
                }
            }
            let report = rig.render(Some(&input));
            let preview = report.locomotion.and_then(|l| l.preview);
            if tick < release_at {
                if preview.is_some() {
                    last_preview = preview;
                }
            } else if preview.is_some() {
                preview_after_release = true;
            }
            recorder.capture(&rig);
        }

        let metrics = rig.metrics();
        match &last_preview {
            Some(preview) => {
                let segments = LocomotionConfig::default().line_segments;
                checks.require(preview.points.len() == segments + 1, || {
                    format!("preview has {} points", preview.points.len())
                });
            }
            None => checks.require(false, || "no guide preview while guiding".to_string()),
        }
        checks.require(landing_error < 1e-9, || {
            format!("feet landed {:.6}m from the previewed landing", landing_error)
        });
        checks.require(!preview_after_release, || "preview drawn after release".to_string());
        checks.require(metrics.teleports == 1, || format!("{} teleports", metrics.teleports));

        let head = rig.bus.published_count(&publisher.headset_topic);
        let left = rig.bus.published_count(&publisher.left_controller_topic);
        let right = rig.bus.published_count(&publisher.right_controller_topic);
        checks.require(head > 0 && head == left && left == right, || {
            format!("published head/left/right = {}/{}/{}", head, left, right)
        });

        rig.outcome(checks, metrics)
    }

    /// XRS-005: GrabNavigate - two-handed scale, yaw and translation.
    ///
    /// Both grips are held while the hands spread from 0.6m to 1.2m apart
    /// and twist by 0.5rad about the vertical.
    /// **Assertion**: the viewer scale halves, the reference yaw turns by
    /// the opposite of the twist, and point sizes compensate for the scale.
    async fn run_grab_navigate(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-005: GrabNavigate - two-handed navigation");

        let mut config = ViewerConfig::default();
        config.topics.push(TopicConfig::new(CLOUD_TOPIC, MessageKind::PointCloud2));

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();
        let failures = rig.controller.attach_configured_topics();
        checks.require(failures.is_empty(), || format!("{} topics failed to attach", failures.len()));

        let ticks = self.target_ticks();
        let start = grab_input(0.0);
        rig.controller.locomotion_mut().squeeze_start(Hand::Left, &start);
        rig.controller.locomotion_mut().squeeze_start(Hand::Right, &start);
        checks.require(rig.controller.locomotion().is_grabbing(), || "grab did not engage".to_string());

        let cloud = rig.oracle.point_cloud();
        rig.inject(CLOUD_TOPIC, Message::PointCloud2(cloud));

        for tick in 0..ticks {
            let input = grab_input((tick + 1) as f64 / ticks as f64);
            rig.advance();
            rig.flush();
            rig.render(Some(&input));
            recorder.capture(&rig);
        }

        let end = grab_input(1.0);
        rig.controller.locomotion_mut().squeeze_end(Hand::Left);
        checks.require(!rig.controller.locomotion().is_grabbing(), || "grab did not release".to_string());
        rig.advance();
        rig.render(Some(&end));
        recorder.event("Grab released");
        recorder.capture(&rig);

        let metrics = rig.metrics();
        let reference = *rig.controller.locomotion().reference();
        checks.require(metrics.teleports == ticks, || {
            format!("{} grab steps over {} ticks", metrics.teleports, ticks)
        });
        checks.require((reference.scale - 0.5).abs() < 1e-6, || {
            format!("viewer scale {:.6}, expected 0.5", reference.scale)
        });
        checks.require((reference.yaw() + GRAB_TWIST).abs() < 1e-6, || {
            format!("viewer yaw {:.6}, expected {:.6}", reference.yaw(), -GRAB_TWIST)
        });

        match rig.cloud_ring(CLOUD_TOPIC) {
            Some(ring) => {
                let expected = PointCloudOptions::default().point_size / reference.scale as f32;
                let rendered = lock(&ring).rendered_point_size();
                checks.require((rendered - expected).abs() <= expected * 1e-5, || {
                    format!("point size {} not compensated (expected {})", rendered, expected)
                });
            }
            None => checks.require(false, || "cloud ring missing".to_string()),
        }

        rig.outcome(checks, metrics)
    }

    /// XRS-006: GridStream - lossy occupancy grid stream.
    ///
    /// **Assertion**: every delivered map is rasterized, the texture has the
    /// map's dimensions, and unknown cells keep the unknown color.
    async fn run_grid_stream(&self, recorder: &mut Recorder) -> Outcome {
        info!("XRS-006: GridStream - occupancy grid with 30% loss");

        let mut config = ViewerConfig::default();
        config.topics.push(TopicConfig::new(MAP_TOPIC, MessageKind::OccupancyGrid));
        let fixed_frame = config.tf.fixed_frame.clone();

        let mut rig = Rig::new(self.seed, config, self.tick_rate_hz);
        let mut checks = Checks::default();
        let failures = rig.controller.attach_configured_topics();
        checks.require(failures.is_empty(), || format!("{} topics failed to attach", failures.len()));
        rig.bus.set_drop_rate(0.3);

        let ticks = self.target_ticks();
        let mut last_sent = None;
        for _ in 0..ticks {
            rig.advance();
            let grid = rig.oracle.occupancy_grid(&fixed_frame);
            last_sent = Some(grid.clone());
            rig.inject(MAP_TOPIC, Message::OccupancyGrid(grid));
            rig.flush();
            rig.render(None);
            recorder.capture(&rig);
        }

        let metrics = rig.metrics();
        checks.require(metrics.messages_delivered + metrics.messages_dropped == ticks, || {
            format!(
                "{} delivered + {} dropped != {} sent",
                metrics.messages_delivered, metrics.messages_dropped, ticks
            )
        });

        let Some(layer) = rig.grid_layer(MAP_TOPIC) else {
            checks.require(false, || "grid layer missing".to_string());
            return rig.outcome(checks, metrics);
        };
        let layer = lock(&layer);
        checks.require(layer.updates() == metrics.messages_delivered, || {
            format!("{} maps delivered, {} rasterized", metrics.messages_delivered, layer.updates())
        });

        if metrics.messages_delivered > 0 {
            match (layer.texture(), last_sent) {
                (Some(texture), Some(sent)) => {
                    checks.require(texture.width == sent.info.width && texture.height == sent.info.height, || {
                        format!("texture {}x{}", texture.width, texture.height)
                    });
                    let unknown = cell_color(UNKNOWN_CELL, &GridOptions::default());
                    let painted = texture.pixels.chunks_exact(4).filter(|p| *p == &unknown[..]).count();
                    let cells = sent.data.iter().filter(|&&v| v == UNKNOWN_CELL).count();
                    checks.require(painted == cells, || {
                        format!("{} unknown pixels for {} unknown cells", painted, cells)
                    });
                }
                _ => checks.require(false, || "no texture after deliveries".to_string()),
            }
            checks.require(layer.world_placement().is_some(), || "grid has no placement".to_string());
        }

        drop(layer);
        rig.outcome(checks, metrics)
    }
}

/// Headset at standing height, right controller pitched 30° up and
/// pointing down-range (−Z).
fn guide_input(hand_tracking: bool) -> XrFrameInput {
    let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_6);
    let right = Isometry3::from_parts(Translation3::new(0.2, 1.4, -0.3), pitch);
    let left = Isometry3::translation(-0.2, 1.4, -0.3);
    XrFrameInput {
        head: Isometry3::translation(0.0, 1.6, 0.0),
        controllers: [
            Some(TrackedInput {
                pose: left,
                hand_tracking,
            }),
            Some(TrackedInput::controller(right)),
        ],
    }
}

/// Both controllers level in front of the viewer. At `progress` 0 they are
/// 0.6m apart; at 1 they are 1.2m apart and twisted by [`GRAB_TWIST`].
fn grab_input(progress: f64) -> XrFrameInput {
    let center = Vector3::new(0.0, 1.2, -0.4);
    let half_width = 0.3 + 0.3 * progress;
    let twist = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), GRAB_TWIST * progress);
    let left = center + twist * Vector3::new(-half_width, 0.0, 0.0);
    let right = center + twist * Vector3::new(half_width, 0.0, 0.0);
    XrFrameInput {
        head: Isometry3::translation(0.0, 1.6, 0.0),
        controllers: [
            Some(TrackedInput::controller(Isometry3::translation(left.x, left.y, left.z))),
            Some(TrackedInput::controller(Isometry3::translation(right.x, right.y, right.z))),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_ticks_has_floor() {
        assert_eq!(ScenarioRunner::new(1).with_duration(0.0).target_ticks(), 2);
        assert_eq!(ScenarioRunner::new(1).with_duration(2.0).target_ticks(), 60);
        assert_eq!(
            ScenarioRunner::new(1).with_tick_rate(90).with_duration(1.0).target_ticks(),
            90
        );
    }

    #[test]
    fn test_grab_input_geometry() {
        let start = grab_input(0.0);
        let end = grab_input(1.0);
        let span = |f: &XrFrameInput| {
            let l = f.controllers[0].unwrap().pose.translation.vector;
            let r = f.controllers[1].unwrap().pose.translation.vector;
            (l - r).norm()
        };
        assert!((span(&start) - 0.6).abs() < 1e-12);
        assert!((span(&end) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn test_checks_collect_reasons() {
        let mut checks = Checks::default();
        checks.require(true, || "unused".to_string());
        assert_eq!(checks.reason(), None);
        checks.require(false, || "a".to_string());
        checks.require(false, || "b".to_string());
        assert_eq!(checks.reason().as_deref(), Some("a; b"));
    }

    #[tokio::test]
    async fn test_all_scenarios_pass() {
        let runner = ScenarioRunner::new(42).with_duration(5.0);
        for scenario in ScenarioId::all() {
            let result = runner.run(scenario).await;
            assert!(
                result.passed,
                "{} failed: {:?}",
                scenario,
                result.failure_reason
            );
            assert!(result.total_ticks >= 150);
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_metrics() {
        let runner = ScenarioRunner::new(7).with_duration(2.0);
        for scenario in [ScenarioId::MarkerChurn, ScenarioId::GridStream] {
            let a = runner.run(scenario).await;
            let b = runner.run(scenario).await;
            assert_eq!(
                serde_json::to_value(&a.metrics).unwrap(),
                serde_json::to_value(&b.metrics).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_smooth_follow_converges_other_seeds() {
        for seed in [1, 99, 12345] {
            let result = ScenarioRunner::new(seed)
                .with_duration(4.0)
                .run(ScenarioId::SmoothFollow)
                .await;
            assert!(result.passed, "seed {}: {:?}", seed, result.failure_reason);
            assert!(result.metrics.pose_error < 0.02);
        }
    }

    #[tokio::test]
    async fn test_export_samples_frames() {
        let runner = ScenarioRunner::new(5).with_duration(1.0);
        let (result, export) = runner.run_with_export(ScenarioId::CloudFlood, 10).await;
        assert_eq!(export.passed, result.passed);
        assert_eq!(export.seed, 5);
        assert_eq!(export.frames.len(), 3);
        assert!(export.frames.iter().all(|f| f.tick % 10 == 0));
    }
}
