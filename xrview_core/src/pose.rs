//! Pose conversion and per-tick smoothing.
//!
//! Stream updates only ever set a *target*. The rendered value moves toward
//! that target by a fixed fraction on each render tick, so motion stays
//! smooth regardless of how irregularly updates arrive.

use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};
use xrview_env::msgs;

/// Default convergence fraction applied per render tick.
pub const DEFAULT_BLEND: f64 = 0.2;

/// Converts a wire pose into an isometry. Non-normalized quaternions are
/// normalized; an all-zero quaternion becomes identity.
pub fn pose_from_msg(pose: &msgs::Pose) -> Isometry3<f64> {
    let p = &pose.position;
    Isometry3::from_parts(
        Translation3::new(p.x, p.y, p.z),
        rotation_from_msg(&pose.orientation),
    )
}

/// Converts a wire transform into an isometry.
pub fn pose_from_transform(transform: &msgs::Transform) -> Isometry3<f64> {
    let t = &transform.translation;
    Isometry3::from_parts(
        Translation3::new(t.x, t.y, t.z),
        rotation_from_msg(&transform.rotation),
    )
}

/// Converts a wire quaternion into a unit quaternion.
pub fn rotation_from_msg(q: &msgs::Quaternion) -> UnitQuaternion<f64> {
    let raw = Quaternion::new(q.w, q.x, q.y, q.z);
    UnitQuaternion::try_new(raw, 1.0e-12).unwrap_or_else(UnitQuaternion::identity)
}

/// Converts an isometry into a wire transform.
pub fn transform_to_msg(pose: &Isometry3<f64>) -> msgs::Transform {
    let p = pose_to_msg(pose);
    msgs::Transform {
        translation: msgs::Vector3::new(p.position.x, p.position.y, p.position.z),
        rotation: p.orientation,
    }
}

/// Converts an isometry back into a wire pose.
pub fn pose_to_msg(pose: &Isometry3<f64>) -> msgs::Pose {
    let t = pose.translation.vector;
    let q = pose.rotation.quaternion();
    msgs::Pose {
        position: msgs::Point::new(t.x, t.y, t.z),
        orientation: msgs::Quaternion {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        },
    }
}

/// Moves `from` toward `to` by `alpha`: lerp on translation, slerp on rotation.
pub fn blend(from: &Isometry3<f64>, to: &Isometry3<f64>, alpha: f64) -> Isometry3<f64> {
    let translation = from.translation.vector.lerp(&to.translation.vector, alpha);
    // try_slerp flips hemispheres itself; None only for numerically ambiguous input
    let rotation = from
        .rotation
        .try_slerp(&to.rotation, alpha, 1.0e-9)
        .unwrap_or(to.rotation);
    Isometry3::from_parts(Translation3::from(translation), rotation)
}

/// Euclidean distance between the translations of two poses.
pub fn translation_distance(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}

/// A pose whose rendered value chases its latest target.
#[derive(Debug, Clone)]
pub struct SmoothedPose {
    target: Option<Isometry3<f64>>,
    rendered: Isometry3<f64>,
    alpha: f64,
}

impl SmoothedPose {
    /// Creates a pose resting at the origin with the given blend factor.
    pub fn new(alpha: f64) -> Self {
        Self {
            target: None,
            rendered: Isometry3::identity(),
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    /// Stores a new target. The very first target is adopted immediately.
    pub fn set_target(&mut self, pose: Isometry3<f64>) {
        if self.target.is_none() {
            self.rendered = pose;
        }
        self.target = Some(pose);
    }

    /// Advances the rendered pose one tick toward the target.
    pub fn tick(&mut self) {
        if let Some(target) = &self.target {
            self.rendered = blend(&self.rendered, target, self.alpha);
        }
    }

    pub fn rendered(&self) -> Isometry3<f64> {
        self.rendered
    }

    pub fn target(&self) -> Option<Isometry3<f64>> {
        self.target
    }

    pub fn has_observation(&self) -> bool {
        self.target.is_some()
    }
}

impl Default for SmoothedPose {
    fn default() -> Self {
        Self::new(DEFAULT_BLEND)
    }
}

/// Scalar counterpart of [`SmoothedPose`], used for joint angles.
#[derive(Debug, Clone, Copy)]
pub struct SmoothedScalar {
    target: Option<f64>,
    rendered: f64,
    alpha: f64,
}

impl SmoothedScalar {
    pub fn new(alpha: f64) -> Self {
        Self {
            target: None,
            rendered: 0.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn set_target(&mut self, value: f64) {
        if self.target.is_none() {
            self.rendered = value;
        }
        self.target = Some(value);
    }

    pub fn tick(&mut self) {
        if let Some(target) = self.target {
            self.rendered += (target - self.rendered) * self.alpha;
        }
    }

    pub fn rendered(&self) -> f64 {
        self.rendered
    }
}

/// Returns the unit vector of `v`, or `None` for a (near) zero vector.
pub fn try_unit(v: &Vector3<f64>) -> Option<Vector3<f64>> {
    let n = v.norm();
    if n > 1.0e-9 && n.is_finite() {
        Some(v / n)
    } else {
        None
    }
}
