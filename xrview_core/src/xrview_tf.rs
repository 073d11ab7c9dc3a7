//! The "TF" Engine - Named frame resolution with smoothed poses
//!
//! Consumers ask for a frame by name and receive a [`FrameTracker`]. All
//! trackers of the same name share one upstream subscription; the last
//! tracker to let go tears it down.
//!
//! ```text
//! TransformSource ──update──► FrameState.target
//!                                   │
//!                     tick() ───────┴──► FrameState.rendered ──► FrameTracker::pose()
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use xrview_env::{SubscriptionId, TransformSource};

use crate::pose::{pose_from_transform, translation_distance, SmoothedPose, DEFAULT_BLEND};
use crate::scene::{lock, shared, Shared};

/// Tuning for the transform cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformCacheConfig {
    /// Fraction of the remaining distance covered per render tick
    pub blend: f64,

    /// Rotation change (radians) below which an update is ignored
    pub angular_threshold: f64,

    /// Translation change (meters) below which an update is ignored
    pub translation_threshold: f64,
}

impl Default for TransformCacheConfig {
    fn default() -> Self {
        Self {
            blend: DEFAULT_BLEND,
            angular_threshold: 0.01,
            translation_threshold: 0.01,
        }
    }
}

/// Target/rendered state of one frame.
#[derive(Debug)]
pub struct FrameState {
    pose: SmoothedPose,
    updates: u64,
    ignored: u64,
}

impl FrameState {
    fn new(blend: f64) -> Self {
        Self {
            pose: SmoothedPose::new(blend),
            updates: 0,
            ignored: 0,
        }
    }

    /// Records an incoming pose. Returns false when it is within both
    /// thresholds of the current target and was dropped.
    fn observe(&mut self, pose: Isometry3<f64>, config: &TransformCacheConfig) -> bool {
        if let Some(target) = self.pose.target() {
            let moved = translation_distance(&target, &pose);
            let turned = target.rotation.angle_to(&pose.rotation);
            if moved < config.translation_threshold && turned < config.angular_threshold {
                self.ignored += 1;
                return false;
            }
        }
        self.pose.set_target(pose);
        self.updates += 1;
        true
    }

    pub fn rendered(&self) -> Isometry3<f64> {
        self.pose.rendered()
    }

    pub fn target(&self) -> Option<Isometry3<f64>> {
        self.pose.target()
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn ignored(&self) -> u64 {
        self.ignored
    }
}

struct FrameEntry {
    consumers: usize,
    subscription: SubscriptionId,
    state: Shared<FrameState>,
}

/// Reference-counted cache of smoothed frame poses.
///
/// Cloning is cheap and every clone sees the same frames.
#[derive(Clone)]
pub struct TransformCache {
    source: Arc<dyn TransformSource>,
    frames: Shared<HashMap<String, FrameEntry>>,
    config: TransformCacheConfig,
}

impl TransformCache {
    /// Creates an empty cache on top of a transform source.
    pub fn new(source: Arc<dyn TransformSource>, config: TransformCacheConfig) -> Self {
        Self {
            source,
            frames: shared(HashMap::new()),
            config,
        }
    }

    /// Returns a tracker bound to `frame_name`. An empty name yields a
    /// tracker with no subscription that reports the origin.
    pub fn resolve_pose(&self, frame_name: &str) -> FrameTracker {
        let mut tracker = FrameTracker {
            cache: self.clone(),
            name: String::new(),
            state: None,
        };
        tracker.track(frame_name);
        tracker
    }

    /// Advances every tracked frame one render tick.
    pub fn tick(&self) {
        let frames = lock(&self.frames);
        for entry in frames.values() {
            lock(&entry.state).pose.tick();
        }
    }

    /// Rendered pose of a frame, if anything tracks it.
    pub fn lookup(&self, frame_name: &str) -> Option<Isometry3<f64>> {
        lock(&self.frames)
            .get(frame_name)
            .map(|entry| lock(&entry.state).rendered())
    }

    /// Number of frames with at least one consumer.
    pub fn frame_count(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Names of all tracked frames, sorted.
    pub fn frame_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.frames).keys().cloned().collect();
        names.sort();
        names
    }

    /// Consumer count for a frame (0 when untracked).
    pub fn consumers(&self, frame_name: &str) -> usize {
        lock(&self.frames)
            .get(frame_name)
            .map(|entry| entry.consumers)
            .unwrap_or(0)
    }

    pub fn config(&self) -> &TransformCacheConfig {
        &self.config
    }

    fn acquire(&self, frame_name: &str) -> Shared<FrameState> {
        let mut frames = lock(&self.frames);
        if let Some(entry) = frames.get_mut(frame_name) {
            entry.consumers += 1;
            return entry.state.clone();
        }

        let state = shared(FrameState::new(self.config.blend));
        let handler_state = state.clone();
        let config = self.config.clone();
        let name = frame_name.to_string();
        let subscription = self.source.subscribe_frame(
            frame_name,
            Box::new(move |msg| {
                let pose = pose_from_transform(&msg.transform);
                if !lock(&handler_state).observe(pose, &config) {
                    trace!(frame = %name, "Transform update below thresholds");
                }
            }),
        );
        debug!(frame = %frame_name, subscription = %subscription, "Subscribed to frame");

        frames.insert(
            frame_name.to_string(),
            FrameEntry {
                consumers: 1,
                subscription,
                state: state.clone(),
            },
        );
        state
    }

    fn release(&self, frame_name: &str) {
        let mut frames = lock(&self.frames);
        let remove = match frames.get_mut(frame_name) {
            Some(entry) => {
                entry.consumers = entry.consumers.saturating_sub(1);
                entry.consumers == 0
            }
            None => false,
        };
        if remove {
            if let Some(entry) = frames.remove(frame_name) {
                self.source.unsubscribe_frame(entry.subscription);
                debug!(frame = %frame_name, "Released frame");
            }
        }
    }
}

/// A consumer's live handle on one frame.
///
/// At most one subscription is held at a time; retargeting with
/// [`FrameTracker::track`] releases the old frame before acquiring the new.
pub struct FrameTracker {
    cache: TransformCache,
    name: String,
    state: Option<Shared<FrameState>>,
}

impl FrameTracker {
    /// Switches this tracker to another frame. No-op if the name is unchanged.
    pub fn track(&mut self, frame_name: &str) {
        if self.name == frame_name {
            return;
        }
        if self.state.take().is_some() {
            self.cache.release(&self.name);
        }
        self.name = frame_name.to_string();
        if !frame_name.is_empty() {
            self.state = Some(self.cache.acquire(frame_name));
        }
    }

    /// Rendered pose, or identity before the first update.
    pub fn pose(&self) -> Isometry3<f64> {
        self.state
            .as_ref()
            .map(|state| lock(state).rendered())
            .unwrap_or_else(Isometry3::identity)
    }

    /// Whether any update has arrived for the current frame.
    pub fn has_pose(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| lock(state).target().is_some())
            .unwrap_or(false)
    }

    pub fn frame_name(&self) -> &str {
        &self.name
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        if self.state.take().is_some() {
            self.cache.release(&self.name);
        }
    }
}

impl std::fmt::Debug for FrameTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameTracker")
            .field("name", &self.name)
            .field("pose", &self.pose())
            .finish()
    }
}
