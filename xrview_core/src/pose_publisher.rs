//! Publishes headset and controller poses back to the robot.
//!
//! Poses are taken in the viewer's world space (Y-up) and re-expressed in
//! the robot's fixed frame (Z-up) before publishing as `PoseStamped`.

use std::f64::consts::FRAC_PI_2;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use tracing::trace;
use xrview_env::msgs::{Header, PoseStamped, Time};
use xrview_env::{EnvError, Message, TopicTransport};

use crate::config::VrPublisherConfig;
use crate::pose::pose_to_msg;
use crate::xrview_locomotion::{Hand, ReferenceFrame, XrFrameInput};

/// Re-expresses a Y-up viewer pose in the Z-up robot convention.
///
/// Position `(x, y, z)` becomes `(x, -z, y)`; orientation becomes
/// `q_x(π/2) · q · q_x(-π/2) · q_z(π/2)`.
pub fn y_up_to_z_up(pose: &Isometry3<f64>) -> Isometry3<f64> {
    let t = pose.translation.vector;
    let to_z_up = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_2);
    let axes = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -FRAC_PI_2)
        * UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
    Isometry3::from_parts(
        Translation3::new(t.x, -t.z, t.y),
        to_z_up * pose.rotation * axes,
    )
}

/// Wire timestamp for a wall-clock instant.
pub fn stamp_from(time: SystemTime) -> Time {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    Time {
        sec: since.as_secs() as i32,
        nanosec: since.subsec_nanos(),
    }
}

/// Rate-limited publisher of headset and controller poses.
#[derive(Debug)]
pub struct VrPosePublisher {
    config: VrPublisherConfig,
    fixed_frame: String,
    last_publish: Option<Duration>,
    published: u64,
}

impl VrPosePublisher {
    pub fn new(config: VrPublisherConfig, fixed_frame: &str) -> Self {
        Self {
            config,
            fixed_frame: fixed_frame.to_string(),
            last_publish: None,
            published: 0,
        }
    }

    pub fn config(&self) -> &VrPublisherConfig {
        &self.config
    }

    /// Number of completed publish rounds.
    pub fn published(&self) -> u64 {
        self.published
    }

    fn due(&self, now: Duration) -> bool {
        if !self.config.enabled || self.config.publish_rate <= 0.0 {
            return false;
        }
        match self.last_publish {
            None => true,
            Some(last) => {
                now.saturating_sub(last).as_secs_f64() >= 1.0 / self.config.publish_rate
            }
        }
    }

    /// Publishes one round if enabled, due, and both controllers are tracked.
    ///
    /// # Arguments
    /// * `now` - Monotonic context time, used for rate limiting
    /// * `wall` - Wall-clock time, used for the header stamp
    /// * `input` - Tracking-space poses for this frame
    /// * `reference` - Current tracking-to-world transform
    ///
    /// # Returns
    /// * `Ok(true)` - Three poses were published
    /// * `Ok(false)` - Nothing was due or a controller is missing
    pub fn maybe_publish(
        &mut self,
        now: Duration,
        wall: SystemTime,
        input: &XrFrameInput,
        reference: &ReferenceFrame,
        transport: &dyn TopicTransport,
    ) -> Result<bool, EnvError> {
        if !self.due(now) {
            return Ok(false);
        }
        let (Some(left), Some(right)) = (input.controller(Hand::Left), input.controller(Hand::Right))
        else {
            trace!("Skipping pose publish, controllers not tracked");
            return Ok(false);
        };

        let stamp = stamp_from(wall);
        let rounds = [
            (&self.config.headset_topic, input.head),
            (&self.config.left_controller_topic, left.pose),
            (&self.config.right_controller_topic, right.pose),
        ];
        for (topic, local) in rounds {
            let world = reference.pose_to_world(&local);
            let msg = PoseStamped {
                header: Header {
                    stamp,
                    frame_id: self.fixed_frame.clone(),
                },
                pose: pose_to_msg(&y_up_to_z_up(&world)),
            };
            transport.publish(topic, Message::PoseStamped(msg))?;
        }

        self.last_publish = Some(now);
        self.published += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::LoopbackBus;
    use crate::xrview_locomotion::TrackedInput;
    use approx::assert_relative_eq;

    fn input(with_right: bool) -> XrFrameInput {
        XrFrameInput {
            head: Isometry3::translation(1.0, 1.6, -2.0),
            controllers: [
                Some(TrackedInput::controller(Isometry3::translation(-0.2, 1.0, 0.0))),
                with_right.then(|| TrackedInput::controller(Isometry3::translation(0.2, 1.0, 0.0))),
            ],
        }
    }

    fn enabled() -> VrPublisherConfig {
        VrPublisherConfig {
            enabled: true,
            publish_rate: 10.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_y_up_to_z_up_position() {
        let converted = y_up_to_z_up(&Isometry3::translation(1.0, 2.0, 3.0));
        assert_relative_eq!(converted.translation.vector, Vector3::new(1.0, -3.0, 2.0));
    }

    #[test]
    fn test_identity_orientation_maps_forward_to_robot_x() {
        // The published x axis points where viewer forward (-Z) lands
        let converted = y_up_to_z_up(&Isometry3::identity());
        let forward = converted.rotation * Vector3::x();
        let expected = to_z_up_direction(&Vector3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(forward, expected, epsilon = 1e-12);
    }

    fn to_z_up_direction(v: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(v.x, -v.z, v.y)
    }

    #[test]
    fn test_rate_limited_and_requires_both_controllers() {
        let bus = LoopbackBus::new();
        let mut publisher = VrPosePublisher::new(enabled(), "map");
        let reference = ReferenceFrame::default();
        let wall = UNIX_EPOCH + Duration::from_secs(5);

        assert!(!publisher
            .maybe_publish(Duration::ZERO, wall, &input(false), &reference, bus.as_ref())
            .unwrap());
        assert!(publisher
            .maybe_publish(Duration::ZERO, wall, &input(true), &reference, bus.as_ref())
            .unwrap());
        assert!(!publisher
            .maybe_publish(Duration::from_millis(50), wall, &input(true), &reference, bus.as_ref())
            .unwrap());
        assert!(publisher
            .maybe_publish(Duration::from_millis(150), wall, &input(true), &reference, bus.as_ref())
            .unwrap());

        let published = bus.published();
        assert_eq!(published.len(), 6);
        assert_eq!(published[0].0, "/vr/headset");
        let Message::PoseStamped(head) = &published[0].1 else {
            panic!("expected pose");
        };
        assert_eq!(head.header.frame_id, "map");
        assert_eq!(head.header.stamp.sec, 5);
        assert_relative_eq!(head.pose.position.y, 2.0);
        assert_relative_eq!(head.pose.position.z, 1.6);
    }

    #[test]
    fn test_disabled_never_publishes() {
        let bus = LoopbackBus::new();
        let mut publisher = VrPosePublisher::new(VrPublisherConfig::default(), "map");
        let published = publisher
            .maybe_publish(Duration::ZERO, UNIX_EPOCH, &input(true), &ReferenceFrame::default(), bus.as_ref())
            .unwrap();
        assert!(!published);
        assert!(bus.published().is_empty());
    }
}
