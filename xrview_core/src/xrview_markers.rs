//! The "MARKER" Engine - Keyed entity lifecycle driven by marker streams
//!
//! Every marker is identified by `(namespace, id)`. ADD and MODIFY both
//! mean "create if absent, then update appearance"; DELETE removes one key;
//! DELETEALL clears the registry.
//!
//! Mesh-backed markers load asynchronously. The key is recorded as
//! *pending* before the load is spawned so a second ADD never starts a
//! duplicate load. Completions come back over a channel and are applied on
//! the render context by [`MarkerLifecycleManager::poll_loads`].
//!
//! # Delete vs. in-flight load
//!
//! Each pending load carries a generation number. DELETE and DELETEALL drop
//! the pending record, so when the load later lands its generation no
//! longer matches and the result is discarded. A deleted marker never
//! reappears.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{Isometry3, Vector3};
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};
use xrview_env::msgs::Marker;
use xrview_env::{EnvError, MeshAsset, MeshFormat, MeshLoader, SceneContext};

use crate::pose::pose_from_msg;
use crate::scene::{lock, shared, Shared};

// ============================================================================
// WIRE ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerType {
    Arrow = 0,
    Cube = 1,
    Sphere = 2,
    Cylinder = 3,
    LineStrip = 4,
    LineList = 5,
    CubeList = 6,
    SphereList = 7,
    Points = 8,
    TextViewFacing = 9,
    MeshResource = 10,
    TriangleList = 11,
}

impl MarkerType {
    pub fn from_i32(value: i32) -> Option<Self> {
        use MarkerType::*;
        let ty = match value {
            0 => Arrow,
            1 => Cube,
            2 => Sphere,
            3 => Cylinder,
            4 => LineStrip,
            5 => LineList,
            6 => CubeList,
            7 => SphereList,
            8 => Points,
            9 => TextViewFacing,
            10 => MeshResource,
            11 => TriangleList,
            _ => return None,
        };
        Some(ty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerAction {
    Add = 0,
    Modify = 1,
    Delete = 2,
    DeleteAll = 3,
}

impl MarkerAction {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(MarkerAction::Add),
            1 => Some(MarkerAction::Modify),
            2 => Some(MarkerAction::Delete),
            3 => Some(MarkerAction::DeleteAll),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("Unknown marker action: {0}")]
    UnknownAction(i32),

    #[error("Unsupported mesh resource: {0}")]
    UnsupportedResource(String),

    #[error("Mesh load failed: {0}")]
    LoadFailed(#[from] EnvError),
}

// ============================================================================
// ENTITIES
// ============================================================================

/// Registry key: `(namespace, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerKey {
    pub ns: String,
    pub id: i32,
}

impl MarkerKey {
    pub fn new(ns: impl Into<String>, id: i32) -> Self {
        Self { ns: ns.into(), id }
    }

    pub fn of(marker: &Marker) -> Self {
        Self::new(marker.ns.clone(), marker.id)
    }
}

impl std::fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.ns, self.id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    /// Unit cube
    Box,
    Sphere { radius: f64 },
    Cylinder { radius: f64, height: f64 },
    Mesh(Arc<MeshAsset>),
    /// Empty node standing in for unsupported or failed content
    Placeholder,
}

/// Properties refreshed by every ADD/MODIFY.
#[derive(Debug, Clone, PartialEq)]
pub struct Appearance {
    pub pose: Isometry3<f64>,
    pub scale: Vector3<f64>,
    pub color: [f32; 3],
    pub opacity: f32,
    pub frame_id: String,
}

impl Appearance {
    pub fn from_marker(marker: &Marker) -> Self {
        let s = &marker.scale;
        let c = &marker.color;
        Self {
            pose: pose_from_msg(&marker.pose),
            scale: Vector3::new(s.x, s.y, s.z),
            color: [c.r, c.g, c.b],
            opacity: c.a,
            frame_id: marker.header.frame_id.clone(),
        }
    }
}

/// A live scene entity.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerEntity {
    pub key: MarkerKey,
    pub geometry: Geometry,
    pub appearance: Appearance,
}

#[derive(Debug)]
enum EntitySlot {
    Pending { generation: u64, latest: Appearance },
    Ready(MarkerEntity),
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerStats {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub loads_started: u64,
    pub loads_failed: u64,
    pub stale_discarded: u64,
}

/// Keyed store of marker entities. At most one entry per key.
#[derive(Debug, Default)]
pub struct MarkerRegistry {
    entries: HashMap<MarkerKey, EntitySlot>,
    next_generation: u64,
    stats: MarkerStats,
}

impl MarkerRegistry {
    /// Number of keys, pending or ready.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &MarkerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_pending(&self, key: &MarkerKey) -> bool {
        matches!(self.entries.get(key), Some(EntitySlot::Pending { .. }))
    }

    /// A ready entity by key.
    pub fn get(&self, key: &MarkerKey) -> Option<&MarkerEntity> {
        match self.entries.get(key) {
            Some(EntitySlot::Ready(entity)) => Some(entity),
            _ => None,
        }
    }

    /// All ready entities, sorted by key.
    pub fn entities(&self) -> Vec<&MarkerEntity> {
        let mut ready: Vec<&MarkerEntity> = self
            .entries
            .values()
            .filter_map(|slot| match slot {
                EntitySlot::Ready(entity) => Some(entity),
                EntitySlot::Pending { .. } => None,
            })
            .collect();
        ready.sort_by(|a, b| a.key.cmp(&b.key));
        ready
    }

    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|slot| matches!(slot, EntitySlot::Pending { .. }))
            .count()
    }

    pub fn stats(&self) -> MarkerStats {
        self.stats
    }

    fn insert_ready(&mut self, key: MarkerKey, geometry: Geometry, appearance: Appearance) {
        self.stats.created += 1;
        self.entries.insert(
            key.clone(),
            EntitySlot::Ready(MarkerEntity {
                key,
                geometry,
                appearance,
            }),
        );
    }

    fn insert_pending(&mut self, key: MarkerKey, appearance: Appearance) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.stats.loads_started += 1;
        self.entries.insert(
            key,
            EntitySlot::Pending {
                generation,
                latest: appearance,
            },
        );
        generation
    }

    /// Refreshes an existing entry. Returns false if the key is absent.
    fn update(&mut self, key: &MarkerKey, appearance: Appearance) -> bool {
        match self.entries.get_mut(key) {
            Some(EntitySlot::Ready(entity)) => entity.appearance = appearance,
            Some(EntitySlot::Pending { latest, .. }) => *latest = appearance,
            None => return false,
        }
        self.stats.updated += 1;
        true
    }

    fn remove(&mut self, key: &MarkerKey) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.stats.deleted += 1;
        }
        removed
    }

    fn clear(&mut self) {
        self.stats.deleted += self.entries.len() as u64;
        self.entries.clear();
    }

    /// Lands a finished load if its key is still pending at that generation.
    fn complete(&mut self, completion: LoadCompletion) -> bool {
        let current = match self.entries.get(&completion.key) {
            Some(EntitySlot::Pending { generation, .. }) => *generation,
            _ => 0,
        };
        if current != completion.generation {
            self.stats.stale_discarded += 1;
            debug!(key = %completion.key, "Discarding stale mesh load");
            return false;
        }

        let geometry = match completion.result {
            Ok(asset) => Geometry::Mesh(asset),
            Err(e) => {
                self.stats.loads_failed += 1;
                error!(key = %completion.key, "Mesh load failed: {}", e);
                Geometry::Placeholder
            }
        };
        if let Some(EntitySlot::Pending { latest, .. }) = self.entries.remove(&completion.key) {
            self.insert_ready(completion.key, geometry, latest);
        }
        true
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Result of one spawned mesh load.
#[derive(Debug)]
struct LoadCompletion {
    key: MarkerKey,
    generation: u64,
    result: Result<Arc<MeshAsset>, EnvError>,
}

/// Rewrites `package://pkg/path` into `{base}/models/packages/pkg/path`.
pub fn resolve_resource(resource: &str, package_base_url: &str) -> String {
    match resource.strip_prefix("package://") {
        Some(path) => format!(
            "{}/models/packages/{}",
            package_base_url.trim_end_matches('/'),
            path
        ),
        None => resource.to_string(),
    }
}

/// Drives a [`MarkerRegistry`] from marker messages.
///
/// Generic over the execution context so mesh loads run on Tokio in
/// production and on the simulation scheduler in tests.
pub struct MarkerLifecycleManager<Ctx: SceneContext> {
    context: Arc<Ctx>,
    loader: Arc<dyn MeshLoader>,
    registry: Shared<MarkerRegistry>,
    package_base_url: String,
    completions_tx: UnboundedSender<LoadCompletion>,
    completions_rx: AsyncMutex<UnboundedReceiver<LoadCompletion>>,
}

impl<Ctx: SceneContext> MarkerLifecycleManager<Ctx> {
    pub fn new(context: Arc<Ctx>, loader: Arc<dyn MeshLoader>, package_base_url: &str) -> Self {
        let (completions_tx, completions_rx) = unbounded_channel();
        Self {
            context,
            loader,
            registry: shared(MarkerRegistry::default()),
            package_base_url: package_base_url.to_string(),
            completions_tx,
            completions_rx: AsyncMutex::new(completions_rx),
        }
    }

    /// Shared handle to the registry.
    pub fn registry(&self) -> Shared<MarkerRegistry> {
        self.registry.clone()
    }

    /// Applies one marker message.
    ///
    /// # Returns
    /// * `Ok(())` - The registry reflects the message (a load may be in flight)
    /// * `Err(MarkerError::UnknownAction)` - Action outside ADD..DELETEALL; ignored
    pub fn apply(&self, marker: &Marker) -> Result<(), MarkerError> {
        let action =
            MarkerAction::from_i32(marker.action).ok_or(MarkerError::UnknownAction(marker.action))?;
        let key = MarkerKey::of(marker);

        match action {
            MarkerAction::Add | MarkerAction::Modify => self.upsert(key, marker),
            MarkerAction::Delete => {
                if lock(&self.registry).remove(&key) {
                    debug!(key = %key, "Marker deleted");
                }
            }
            MarkerAction::DeleteAll => {
                lock(&self.registry).clear();
                debug!(ns = %marker.ns, "All markers deleted");
            }
        }
        Ok(())
    }

    fn upsert(&self, key: MarkerKey, marker: &Marker) {
        let appearance = Appearance::from_marker(marker);
        let mut registry = lock(&self.registry);
        if registry.update(&key, appearance.clone()) {
            return;
        }

        let geometry = match MarkerType::from_i32(marker.marker_type) {
            Some(MarkerType::Cube) => Geometry::Box,
            Some(MarkerType::Sphere) => Geometry::Sphere { radius: 0.5 },
            Some(MarkerType::Cylinder) => Geometry::Cylinder {
                radius: 0.5,
                height: 1.0,
            },
            Some(MarkerType::MeshResource) => {
                let url = resolve_resource(&marker.mesh_resource, &self.package_base_url);
                match MeshFormat::from_path(&url) {
                    Some(format) => {
                        let generation = registry.insert_pending(key.clone(), appearance);
                        drop(registry);
                        self.spawn_load(key, generation, url, format);
                        return;
                    }
                    None => {
                        error!(key = %key, "{}", MarkerError::UnsupportedResource(url));
                        Geometry::Placeholder
                    }
                }
            }
            other => {
                debug!(key = %key, marker_type = ?other, "Marker type rendered as placeholder");
                Geometry::Placeholder
            }
        };
        registry.insert_ready(key, geometry, appearance);
    }

    fn spawn_load(&self, key: MarkerKey, generation: u64, url: String, format: MeshFormat) {
        let loader = self.loader.clone();
        let tx = self.completions_tx.clone();
        debug!(key = %key, url = %url, ?format, "Loading mesh");
        self.context.spawn("marker-mesh-load", async move {
            let result = loader.load(&url, format).await.map(Arc::new);
            // The receiver lives as long as the manager
            let _ = tx.send(LoadCompletion {
                key,
                generation,
                result,
            });
        });
    }

    /// Applies every finished load without waiting. Returns how many landed
    /// (stale completions are counted as discarded, not landed).
    pub fn poll_loads(&self) -> usize {
        let Ok(mut rx) = self.completions_rx.try_lock() else {
            warn!("Mesh completions are being awaited elsewhere");
            return 0;
        };
        let mut landed = 0;
        while let Ok(completion) = rx.try_recv() {
            if lock(&self.registry).complete(completion) {
                landed += 1;
            }
        }
        landed
    }

    /// Waits for the next completion and applies it. Returns whether it landed.
    pub async fn settle_next(&self) -> bool {
        let completion = {
            let mut rx = self.completions_rx.lock().await;
            rx.recv().await
        };
        match completion {
            Some(completion) => lock(&self.registry).complete(completion),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use xrview_env::msgs::{ColorRGBA, Header, Vector3 as WireVector3};
    use xrview_env::TokioContext;

    struct StaticLoader {
        fail: bool,
    }

    #[async_trait]
    impl MeshLoader for StaticLoader {
        async fn load(&self, url: &str, _format: MeshFormat) -> Result<MeshAsset, EnvError> {
            if self.fail {
                return Err(EnvError::resource(url, "404"));
            }
            Ok(MeshAsset {
                source: url.to_string(),
                positions: vec![[0.0; 3]; 3],
                indices: vec![0, 1, 2],
            })
        }
    }

    fn manager(fail: bool) -> MarkerLifecycleManager<TokioContext> {
        MarkerLifecycleManager::new(
            TokioContext::shared(),
            Arc::new(StaticLoader { fail }),
            "https://localhost:8080",
        )
    }

    fn marker(id: i32, marker_type: MarkerType, action: MarkerAction) -> Marker {
        Marker {
            header: Header::new("map"),
            ns: "test".to_string(),
            id,
            marker_type: marker_type as i32,
            action: action as i32,
            scale: WireVector3::new(1.0, 2.0, 3.0),
            color: ColorRGBA { r: 1.0, g: 0.5, b: 0.0, a: 0.25 },
            ..Default::default()
        }
    }

    fn mesh_marker(id: i32, resource: &str, action: MarkerAction) -> Marker {
        Marker {
            mesh_resource: resource.to_string(),
            ..marker(id, MarkerType::MeshResource, action)
        }
    }

    #[test]
    fn test_resolve_package_resource() {
        assert_eq!(
            resolve_resource("package://robot/meshes/base.stl", "https://localhost:8080/"),
            "https://localhost:8080/models/packages/robot/meshes/base.stl"
        );
        assert_eq!(resolve_resource("https://x/y.dae", "https://h"), "https://x/y.dae");
    }

    #[tokio::test]
    async fn test_add_then_delete_empties_registry() {
        let m = manager(false);
        m.apply(&marker(1, MarkerType::Cube, MarkerAction::Add)).unwrap();
        assert_eq!(lock(&m.registry).len(), 1);

        m.apply(&marker(1, MarkerType::Cube, MarkerAction::Delete)).unwrap();
        assert!(lock(&m.registry).is_empty());
    }

    #[tokio::test]
    async fn test_modify_updates_existing_entity() {
        let m = manager(false);
        m.apply(&marker(1, MarkerType::Sphere, MarkerAction::Add)).unwrap();

        let mut moved = marker(1, MarkerType::Sphere, MarkerAction::Modify);
        moved.pose.position.x = 4.0;
        moved.color.a = 1.0;
        m.apply(&moved).unwrap();

        let registry = lock(&m.registry);
        let entity = registry.get(&MarkerKey::new("test", 1)).unwrap();
        assert_eq!(entity.geometry, Geometry::Sphere { radius: 0.5 });
        assert_eq!(entity.appearance.pose.translation.vector.x, 4.0);
        assert_eq!(entity.appearance.opacity, 1.0);
        assert_eq!(registry.stats().created, 1);
        assert_eq!(registry.stats().updated, 1);
    }

    #[tokio::test]
    async fn test_delete_all_clears_everything() {
        let m = manager(false);
        for id in 0..5 {
            m.apply(&marker(id, MarkerType::Cylinder, MarkerAction::Add)).unwrap();
        }
        m.apply(&mesh_marker(9, "package://robot/arm.dae", MarkerAction::Add)).unwrap();
        m.apply(&marker(0, MarkerType::Cube, MarkerAction::DeleteAll)).unwrap();
        assert!(lock(&m.registry).is_empty());
    }

    #[tokio::test]
    async fn test_mesh_load_lands_with_latest_appearance() {
        let m = manager(false);
        m.apply(&mesh_marker(2, "package://robot/base.stl", MarkerAction::Add)).unwrap();
        let key = MarkerKey::new("test", 2);
        assert!(lock(&m.registry).is_pending(&key));

        // Second ADD while pending must not start another load
        let mut again = mesh_marker(2, "package://robot/base.stl", MarkerAction::Add);
        again.pose.position.z = 7.0;
        m.apply(&again).unwrap();
        assert_eq!(lock(&m.registry).stats().loads_started, 1);

        assert!(m.settle_next().await);
        let registry = lock(&m.registry);
        let entity = registry.get(&key).unwrap();
        match &entity.geometry {
            Geometry::Mesh(asset) => assert_eq!(
                asset.source,
                "https://localhost:8080/models/packages/robot/base.stl"
            ),
            other => panic!("expected mesh, got {:?}", other),
        }
        assert_eq!(entity.appearance.pose.translation.vector.z, 7.0);
    }

    #[tokio::test]
    async fn test_delete_before_load_rejects_stale_creation() {
        let m = manager(false);
        m.apply(&mesh_marker(3, "world.glb", MarkerAction::Add)).unwrap();
        m.apply(&mesh_marker(3, "world.glb", MarkerAction::Delete)).unwrap();

        assert!(!m.settle_next().await);
        let registry = lock(&m.registry);
        assert!(registry.is_empty());
        assert_eq!(registry.stats().stale_discarded, 1);
    }

    #[tokio::test]
    async fn test_readd_after_delete_only_keeps_new_generation() {
        let m = manager(false);
        m.apply(&mesh_marker(4, "a.stl", MarkerAction::Add)).unwrap();
        m.apply(&mesh_marker(4, "a.stl", MarkerAction::Delete)).unwrap();
        m.apply(&mesh_marker(4, "a.stl", MarkerAction::Add)).unwrap();

        let first = m.settle_next().await;
        let second = m.settle_next().await;
        assert_ne!(first, second);
        let registry = lock(&m.registry);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&MarkerKey::new("test", 4)).is_some());
    }

    #[tokio::test]
    async fn test_failed_load_yields_placeholder() {
        let m = manager(true);
        m.apply(&mesh_marker(5, "missing.stl", MarkerAction::Add)).unwrap();
        assert!(m.settle_next().await);

        let registry = lock(&m.registry);
        let entity = registry.get(&MarkerKey::new("test", 5)).unwrap();
        assert_eq!(entity.geometry, Geometry::Placeholder);
        assert_eq!(registry.stats().loads_failed, 1);
    }

    #[tokio::test]
    async fn test_unsupported_extension_and_type_are_placeholders() {
        let m = manager(false);
        m.apply(&mesh_marker(6, "thing.obj", MarkerAction::Add)).unwrap();
        m.apply(&marker(7, MarkerType::Arrow, MarkerAction::Add)).unwrap();

        let registry = lock(&m.registry);
        assert_eq!(registry.pending_count(), 0);
        for id in [6, 7] {
            let entity = registry.get(&MarkerKey::new("test", id)).unwrap();
            assert_eq!(entity.geometry, Geometry::Placeholder);
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let m = manager(false);
        let mut msg = marker(1, MarkerType::Cube, MarkerAction::Add);
        msg.action = 42;
        assert!(matches!(m.apply(&msg), Err(MarkerError::UnknownAction(42))));
        assert!(lock(&m.registry).is_empty());
    }
}
