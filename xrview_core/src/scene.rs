//! Shared-state plumbing between stream handlers and the render loop.
//!
//! Every engine's state lives behind `Arc<Mutex<_>>`: the subscription
//! handler holds one strong reference, the owning visualizer holds
//! another, and the render loop only ever sees a [`SceneNode`], which is a
//! `Weak` view that stops resolving once the owner is gone.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use uuid::Uuid;
use xrview_env::MessageKind;

use crate::layers::{AxesLayer, GridLayer, PathLayer};
use crate::xrview_cloud::PointCloudRing;
use crate::xrview_markers::MarkerRegistry;

/// State shared between a stream handler and its owner.
pub type Shared<T> = Arc<Mutex<T>>;

/// Wraps a value for sharing.
pub fn shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Handlers never leave state half-written across a panic boundary, so the
/// inner value is always safe to keep using.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Non-owning view of one attached visualization.
#[derive(Debug, Clone)]
pub struct SceneNode {
    pub id: Uuid,
    pub topic: String,
    pub kind: MessageKind,
    pub view: SceneView,
}

/// Typed weak handles onto each kind of renderable state.
#[derive(Debug, Clone)]
pub enum SceneView {
    PointCloud(Weak<Mutex<PointCloudRing>>),
    Grid(Weak<Mutex<GridLayer>>),
    Markers(Weak<Mutex<MarkerRegistry>>),
    Axes(Weak<Mutex<AxesLayer>>),
    Path(Weak<Mutex<PathLayer>>),
}

impl SceneNode {
    pub fn new(topic: impl Into<String>, kind: MessageKind, view: SceneView) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            kind,
            view,
        }
    }

    /// Whether the owning visualization still exists.
    pub fn is_alive(&self) -> bool {
        match &self.view {
            SceneView::PointCloud(w) => w.strong_count() > 0,
            SceneView::Grid(w) => w.strong_count() > 0,
            SceneView::Markers(w) => w.strong_count() > 0,
            SceneView::Axes(w) => w.strong_count() > 0,
            SceneView::Path(w) => w.strong_count() > 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_recovers_from_poison() {
        let state = shared(1u32);
        let clone = state.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(state.is_poisoned());
        *lock(&state) += 1;
        assert_eq!(*lock(&state), 2);
    }

    #[test]
    fn test_node_dies_with_owner() {
        let registry = shared(MarkerRegistry::default());
        let node = SceneNode::new(
            "/markers",
            MessageKind::Marker,
            SceneView::Markers(Arc::downgrade(&registry)),
        );
        assert!(node.is_alive());
        assert_eq!(node.kind, MessageKind::Marker);
        drop(registry);
        assert!(!node.is_alive());
    }
}
