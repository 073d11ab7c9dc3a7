//! The "LOCOMOTION" Engine - Teleport guiding and two-handed grab navigation
//!
//! The viewer stands inside a *reference frame* (position, yaw-only rotation,
//! uniform scale) that maps tracking space to world space. Two gestures move
//! that frame:
//!
//! - **Guide**: hold select on one controller to preview a ballistic arc;
//!   releasing teleports the viewer's feet to where the arc meets the floor.
//! - **Grab**: squeeze both grips, then pull/push/twist to translate, scale
//!   and yaw the world around you, one incremental step per tick.
//!
//! ```text
//!  tracking space ──[ReferenceFrame: T · R_yaw · S]──► world space
//!        ▲                        ▲
//!   controller poses        select/squeeze gestures
//! ```

use std::f64::consts::PI;

use nalgebra::{Isometry3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::pose::try_unit;

// ============================================================================
// CONFIG & INPUT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocomotionConfig {
    /// Launch speed of the guide arc (m/s)
    pub launch_speed: f64,

    /// Constant gravity for the guide arc
    pub gravity: Vector3<f64>,

    /// Segments in the preview polyline
    pub line_segments: usize,

    /// Fraction of flight time at which the landing marker is drawn
    pub marker_fraction: f64,
}

impl Default for LocomotionConfig {
    fn default() -> Self {
        Self {
            launch_speed: 6.0,
            gravity: Vector3::new(0.0, -9.8, 0.0),
            line_segments: 20,
            marker_fraction: 0.98,
        }
    }
}

/// Controller slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Hand {
    Left = 0,
    Right = 1,
}

impl Hand {
    fn index(self) -> usize {
        self as usize
    }
}

/// One tracked input device, in tracking space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedInput {
    pub pose: Isometry3<f64>,
    /// Articulated hand rather than a controller
    pub hand_tracking: bool,
}

impl TrackedInput {
    pub fn controller(pose: Isometry3<f64>) -> Self {
        Self {
            pose,
            hand_tracking: false,
        }
    }

    /// Target-ray direction (local −Z).
    pub fn direction(&self) -> Vector3<f64> {
        self.pose.rotation * -Vector3::<f64>::z()
    }
}

/// Everything the engine reads from the headset for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XrFrameInput {
    /// Headset pose in tracking space
    pub head: Isometry3<f64>,
    pub controllers: [Option<TrackedInput>; 2],
}

impl XrFrameInput {
    pub fn controller(&self, hand: Hand) -> Option<&TrackedInput> {
        self.controllers[hand.index()].as_ref()
    }
}

// ============================================================================
// REFERENCE FRAME
// ============================================================================

/// Tracking-to-world transform of the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFrame {
    pub position: Vector3<f64>,
    /// Always a pure rotation about +Y
    pub rotation: UnitQuaternion<f64>,
    pub scale: f64,
}

impl Default for ReferenceFrame {
    fn default() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: 1.0,
        }
    }
}

impl ReferenceFrame {
    /// Maps a tracking-space point to world space.
    pub fn to_world(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.position + self.rotation * (local * self.scale)
    }

    /// Maps a tracking-space pose to world space (scale affects position only).
    pub fn pose_to_world(&self, local: &Isometry3<f64>) -> Isometry3<f64> {
        Isometry3::from_parts(
            self.to_world(&local.translation.vector).into(),
            self.rotation * local.rotation,
        )
    }

    /// Maps a tracking-space direction to a world-space unit direction.
    pub fn direction_to_world(&self, local: &Vector3<f64>) -> Option<Vector3<f64>> {
        try_unit(&(self.rotation * local))
    }

    /// Floor height in world space.
    pub fn floor_y(&self) -> f64 {
        self.position.y
    }

    pub fn yaw(&self) -> f64 {
        yaw_of(&self.rotation)
    }
}

// ============================================================================
// BALLISTICS
// ============================================================================

/// Position on the arc at time `t`.
pub fn position_at(t: f64, position: &Vector3<f64>, velocity: &Vector3<f64>, gravity: &Vector3<f64>) -> Vector3<f64> {
    position + velocity * t + gravity * (0.5 * t * t)
}

/// Time at which the arc descends through `floor_y`.
///
/// Solves `p_y + v_y·t + ½·g_y·t² = floor_y` for its later root. Returns
/// `None` when gravity does not pull down, when the arc never reaches the
/// floor, or when the root is not in the future.
pub fn time_to_floor(position: &Vector3<f64>, velocity: &Vector3<f64>, gravity: &Vector3<f64>, floor_y: f64) -> Option<f64> {
    let g = gravity.y;
    if g >= 0.0 {
        return None;
    }
    let discriminant = velocity.y * velocity.y - 2.0 * (position.y - floor_y) * g;
    if discriminant < 0.0 {
        return None;
    }
    let t = (velocity.y + discriminant.sqrt()) / -g;
    (t > 0.0 && t.is_finite()).then_some(t)
}

/// A launched arc in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Trajectory {
    start: Vector3<f64>,
    velocity: Vector3<f64>,
    flight_time: f64,
}

impl Trajectory {
    fn at(&self, t: f64, gravity: &Vector3<f64>) -> Vector3<f64> {
        position_at(t, &self.start, &self.velocity, gravity)
    }
}

/// Preview geometry for the active guide.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidePreview {
    pub hand: Hand,
    /// `line_segments + 1` world points from the controller to the floor
    pub points: Vec<Vector3<f64>>,
    /// Marker position, just above the floor
    pub landing_marker: Vector3<f64>,
    /// Where the arc meets the floor
    pub landing: Vector3<f64>,
    pub marker_scale: f64,
    pub flight_time: f64,
}

// ============================================================================
// GRAB
// ============================================================================

/// Two-controller pose snapshot in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrabPose {
    pub midpoint: Vector3<f64>,
    /// Unit vector from right to left controller
    pub difference: Vector3<f64>,
    pub distance: f64,
}

impl GrabPose {
    /// Returns `None` when the controllers coincide.
    pub fn between(left: &Vector3<f64>, right: &Vector3<f64>) -> Option<Self> {
        let delta = left - right;
        let difference = try_unit(&delta)?;
        Some(Self {
            midpoint: (left + right) / 2.0,
            difference,
            distance: delta.norm(),
        })
    }
}

/// One tick of grab navigation, as applied to the reference frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrabUpdate {
    pub scale_multiplier: f64,
    /// Yaw applied this tick (radians)
    pub yaw: f64,
    pub translation: Vector3<f64>,
}

/// Yaw (rotation about +Y) of a quaternion via swing-twist decomposition.
pub fn yaw_of(rotation: &UnitQuaternion<f64>) -> f64 {
    let q = rotation.quaternion();
    if q.j.abs() < 1.0e-12 && q.w.abs() < 1.0e-12 {
        return 0.0;
    }
    let mut yaw = 2.0 * q.j.atan2(q.w);
    if yaw > PI {
        yaw -= 2.0 * PI;
    } else if yaw <= -PI {
        yaw += 2.0 * PI;
    }
    yaw
}

/// Yaw-only rotation taking `from` onto `to`; zero for antiparallel input.
pub fn yaw_between(from: &Vector3<f64>, to: &Vector3<f64>) -> f64 {
    UnitQuaternion::rotation_between(from, to)
        .map(|q| yaw_of(&q))
        .unwrap_or(0.0)
}

// ============================================================================
// ENGINE
// ============================================================================

/// Output of one render tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocomotionTick {
    pub preview: Option<GuidePreview>,
    pub grab: Option<GrabUpdate>,
}

/// Gesture state machine over a shared reference frame.
#[derive(Debug, Clone)]
pub struct LocomotionEngine {
    config: LocomotionConfig,
    reference: ReferenceFrame,
    guiding: Option<Hand>,
    grabbing: [bool; 2],
    last_grab: Option<GrabPose>,
    teleports: u64,
}

impl LocomotionEngine {
    pub fn new(config: LocomotionConfig) -> Self {
        Self {
            config,
            reference: ReferenceFrame::default(),
            guiding: None,
            grabbing: [false, false],
            last_grab: None,
            teleports: 0,
        }
    }

    pub fn reference(&self) -> &ReferenceFrame {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: ReferenceFrame) {
        self.reference = reference;
    }

    pub fn guiding(&self) -> Option<Hand> {
        self.guiding
    }

    pub fn is_grabbing(&self) -> bool {
        self.grabbing[0] && self.grabbing[1] && self.last_grab.is_some()
    }

    pub fn teleports(&self) -> u64 {
        self.teleports
    }

    /// Applies a yaw-only rotation and a translation to the reference frame.
    pub fn teleport(&mut self, offset: Vector3<f64>, yaw: f64) {
        let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), yaw);
        self.reference.rotation = rotation * self.reference.rotation;
        self.reference.position += offset;
        self.teleports += 1;
    }

    /// Begins guiding with `hand`. Articulated hands cannot guide.
    pub fn select_start(&mut self, hand: Hand, input: &XrFrameInput) -> bool {
        match input.controller(hand) {
            Some(device) if !device.hand_tracking => {
                self.guiding = Some(hand);
                true
            }
            _ => false,
        }
    }

    /// Ends guiding. If `hand` was the guiding device and the arc lands,
    /// teleports the viewer's feet onto the landing point and returns the
    /// offset applied.
    pub fn select_end(&mut self, hand: Hand, input: &XrFrameInput) -> Option<Vector3<f64>> {
        if self.guiding != Some(hand) {
            return None;
        }
        self.guiding = None;

        let arc = self.trajectory(hand, input)?;
        let landing = arc.at(arc.flight_time, &self.config.gravity);
        let mut feet = self.reference.to_world(&input.head.translation.vector);
        feet.y = self.reference.floor_y();
        let offset = landing - feet;
        self.teleport(offset, 0.0);
        debug!(x = landing.x, y = landing.y, z = landing.z, "Teleported");
        Some(offset)
    }

    /// Marks a grip as held; with both held, records the grab pose.
    pub fn squeeze_start(&mut self, hand: Hand, input: &XrFrameInput) {
        self.grabbing[hand.index()] = true;
        if self.grabbing[0] && self.grabbing[1] {
            self.last_grab = self.grab_pose(input);
        }
    }

    pub fn squeeze_end(&mut self, hand: Hand) {
        self.grabbing[hand.index()] = false;
        self.last_grab = None;
    }

    /// Advances one render tick.
    pub fn tick(&mut self, input: &XrFrameInput) -> LocomotionTick {
        let preview = self.guiding.and_then(|hand| self.preview(hand, input));
        let grab = if self.is_grabbing() {
            self.grab_step(input)
        } else {
            None
        };
        LocomotionTick { preview, grab }
    }

    fn trajectory(&self, hand: Hand, input: &XrFrameInput) -> Option<Trajectory> {
        let device = input.controller(hand)?;
        let start = self.reference.to_world(&device.pose.translation.vector);
        let velocity = self.reference.direction_to_world(&device.direction())? * self.config.launch_speed;
        let flight_time = time_to_floor(&start, &velocity, &self.config.gravity, self.reference.floor_y())?;
        Some(Trajectory {
            start,
            velocity,
            flight_time,
        })
    }

    fn preview(&self, hand: Hand, input: &XrFrameInput) -> Option<GuidePreview> {
        let arc = self.trajectory(hand, input)?;
        let g = &self.config.gravity;
        let t = arc.flight_time;
        let segments = self.config.line_segments.max(1);
        let points = (0..=segments)
            .map(|i| arc.at(i as f64 * t / segments as f64, g))
            .collect();
        Some(GuidePreview {
            hand,
            points,
            landing_marker: arc.at(t * self.config.marker_fraction, g),
            landing: arc.at(t, g),
            marker_scale: self.reference.scale,
            flight_time: t,
        })
    }

    fn grab_pose(&self, input: &XrFrameInput) -> Option<GrabPose> {
        let left = input.controller(Hand::Left)?;
        let right = input.controller(Hand::Right)?;
        GrabPose::between(
            &self.reference.to_world(&left.pose.translation.vector),
            &self.reference.to_world(&right.pose.translation.vector),
        )
    }

    fn grab_step(&mut self, input: &XrFrameInput) -> Option<GrabUpdate> {
        let recorded = self.last_grab?;
        let current = self.grab_pose(input)?;

        let update = GrabUpdate {
            scale_multiplier: recorded.distance / current.distance,
            yaw: yaw_between(&current.difference, &recorded.difference),
            translation: recorded.midpoint - current.midpoint,
        };
        if !update.scale_multiplier.is_finite() {
            return None;
        }

        self.reference.scale *= update.scale_multiplier;
        self.teleport(update.translation, update.yaw);
        // Refresh against the moved frame so control stays incremental
        self.last_grab = self.grab_pose(input).or(Some(recorded));
        Some(update)
    }
}

impl Default for LocomotionEngine {
    fn default() -> Self {
        Self::new(LocomotionConfig::default())
    }
}
