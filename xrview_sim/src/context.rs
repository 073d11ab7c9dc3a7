//! Simulation context implementing SceneContext for deterministic testing.

use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;
use xrview_env::SceneContext;

type Task = (String, Pin<Box<dyn Future<Output = ()> + Send>>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `SceneContext` using:
/// - A virtual clock that can be advanced manually
/// - A seeded ChaCha8 RNG
/// - A task queue: spawned futures only run when the runner drains them,
///   so the order of load completions is fully controlled
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Spawned but not yet run
    tasks: Arc<Mutex<Vec<Task>>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            tasks: Arc::new(Mutex::new(Vec::new())),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        *lock(&self.virtual_time_ns) += duration.as_nanos() as u64;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *lock(&self.virtual_time_ns)
    }

    /// Runs `f` with exclusive access to the seeded RNG.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> T) -> T {
        f(&mut lock(&self.rng))
    }

    /// Number of spawned tasks waiting to run.
    pub fn pending_tasks(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Runs every queued task to completion in spawn order, including
    /// tasks spawned while draining. Returns how many ran.
    pub async fn run_spawned(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<Task> = std::mem::take(&mut *lock(&self.tasks));
            if batch.is_empty() {
                return ran;
            }
            for (name, task) in batch {
                trace!(task = %name, "Running spawned task");
                task.await;
                ran += 1;
            }
        }
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            tasks: Arc::clone(&self.tasks),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl SceneContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // In simulation, sleep advances virtual time
        self.advance_time(duration);
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        lock(&self.tasks).push((name.to_string(), Box::pin(future)));
    }
}
