//! Simulated mesh loader with injectable failures.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use xrview_env::{EnvError, MeshAsset, MeshFormat, MeshLoader};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves a unit tetrahedron for every URL unless told to fail it.
#[derive(Debug, Default)]
pub struct SimMeshLoader {
    failing: Mutex<HashSet<String>>,
    loads: AtomicU64,
    failures: AtomicU64,
}

impl SimMeshLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every future load of `url` fail with a resource error.
    pub fn fail_url(&self, url: impl Into<String>) {
        lock(&self.failing).insert(url.into());
    }

    /// Loads attempted so far (successful or not).
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// The mesh every successful load returns.
    pub fn tetrahedron(source: &str) -> MeshAsset {
        MeshAsset {
            source: source.to_string(),
            positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
            indices: vec![0, 2, 1, 0, 1, 3, 0, 3, 2, 1, 2, 3],
        }
    }
}

#[async_trait]
impl MeshLoader for SimMeshLoader {
    async fn load(&self, url: &str, format: MeshFormat) -> Result<MeshAsset, EnvError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if lock(&self.failing).contains(url) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(EnvError::resource(url, "injected failure"));
        }
        debug!(url, ?format, "Served simulated mesh");
        Ok(Self::tetrahedron(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_tetrahedron() {
        let loader = SimMeshLoader::new();
        let mesh = loader.load("https://host/a.stl", MeshFormat::Stl).await.unwrap();
        assert_eq!(mesh.triangle_count(), 4);
        assert_eq!(mesh.source, "https://host/a.stl");
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let loader = SimMeshLoader::new();
        loader.fail_url("https://host/broken.dae");
        let result = loader.load("https://host/broken.dae", MeshFormat::Collada).await;
        assert!(matches!(result, Err(EnvError::ResourceError { .. })));
        assert_eq!(loader.failures(), 1);
        assert!(loader.load("https://host/ok.dae", MeshFormat::Collada).await.is_ok());
    }
}
