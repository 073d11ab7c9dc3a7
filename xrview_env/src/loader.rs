//! Asynchronous mesh asset loading.
//!
//! Parsing STL/Collada/glTF is an external concern; the core only needs to
//! know that a load was requested, which format it was, and when it landed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::EnvError;

/// Mesh container formats recognized by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeshFormat {
    Stl,
    Collada,
    Gltf,
}

impl MeshFormat {
    /// Resolves a format from a resource path's extension.
    ///
    /// Returns `None` for anything that is not `.stl`, `.dae`, `.glb` or `.gltf`.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "stl" => Some(MeshFormat::Stl),
            "dae" => Some(MeshFormat::Collada),
            "glb" | "gltf" => Some(MeshFormat::Gltf),
            _ => None,
        }
    }
}

/// A loaded mesh, already triangulated by the asset layer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MeshAsset {
    /// Resolved URL the mesh was fetched from
    pub source: String,

    /// Vertex positions
    pub positions: Vec<[f32; 3]>,

    /// Triangle indices into `positions`
    pub indices: Vec<u32>,
}

impl MeshAsset {
    /// Returns the number of triangles.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

/// Fetches and parses mesh assets.
///
/// # Implementations
///
/// - **Production**: HTTP fetch + format parsers (outside this workspace)
/// - **Simulation**: `SimMeshLoader`, synthetic meshes with injectable failures
#[async_trait]
pub trait MeshLoader: Send + Sync + 'static {
    /// Loads one mesh.
    ///
    /// # Returns
    /// * `Ok(MeshAsset)` - The parsed mesh
    /// * `Err(EnvError::ResourceError)` - Fetch or parse failure
    async fn load(&self, url: &str, format: MeshFormat) -> Result<MeshAsset, EnvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(MeshFormat::from_path("robot/base.stl"), Some(MeshFormat::Stl));
        assert_eq!(MeshFormat::from_path("robot/arm.DAE"), Some(MeshFormat::Collada));
        assert_eq!(MeshFormat::from_path("world.glb"), Some(MeshFormat::Gltf));
        assert_eq!(MeshFormat::from_path("world.gltf"), Some(MeshFormat::Gltf));
        assert_eq!(MeshFormat::from_path("world.obj"), None);
        assert_eq!(MeshFormat::from_path("noextension"), None);
    }
}
