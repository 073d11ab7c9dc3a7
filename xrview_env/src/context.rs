//! Execution context trait for XRView engines.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for time and task spawning.
///
/// Everything in the core runs on one cooperative context. The only work
/// that leaves it is asset loading, which is spawned here and reports back
/// through a channel drained on the render tick.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `tokio::spawn`
/// - **Simulation**: `SimContext` - virtual clock advanced by the runner
#[async_trait]
pub trait SceneContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp published messages.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task (fire-and-forget).
    ///
    /// There is no cancellation: a spawned load always runs to completion
    /// and the receiver decides whether its result is still wanted.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
