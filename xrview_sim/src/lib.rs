//! XRView Deterministic Simulation Harness
//!
//! Runs the full viewer stack (transform cache, visualizers, locomotion,
//! pose publisher) against a simulated robot, with every source of
//! non-determinism under control:
//! - **Time**: virtual clock advanced once per render tick
//! - **Bus**: explicit flush points, throttles and queue depths applied
//!   the way the bridge applies them, seeded message loss
//! - **Randomness**: all entropy derived from a single 64-bit seed
//! - **Assets**: mesh loads queued and completed only when drained
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Rig                               │
//! │  ┌──────────────┐   inject    ┌──────────────────────────┐  │
//! │  │ RobotOracle  │────────────►│ SimBus                   │  │
//! │  │ (truth)      │ set_transform│ (TopicTransport +       │  │
//! │  └──────────────┘             │  TransformSource)        │  │
//! │                               └────────────┬─────────────┘  │
//! │                                    flush   │                │
//! │  ┌──────────────┐  spawn   ┌───────────────▼────────────┐   │
//! │  │ SimContext   │◄─────────│ RenderController           │   │
//! │  │ (clock, rng, │          │  visualizers / locomotion  │   │
//! │  │  task queue) │          └───────────────┬────────────┘   │
//! │  └──────────────┘                          │ publish        │
//! │         ▲ load                             ▼                │
//! │  ┌──────┴───────┐                    SimBus outbox          │
//! │  │SimMeshLoader │                                           │
//! │  └──────────────┘                                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use xrview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let runner = ScenarioRunner::new(42).with_duration(5.0);
//! let result = runner.run(ScenarioId::CloudFlood).await;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod loader;
mod network;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{ExportError, PointSample, SimEvent, SimExport, SimFrame, ViewerSample};
pub use loader::SimMeshLoader;
pub use network::{BusStats, SimBus};
pub use oracle::{OracleConfig, RobotOracle, BASE_FRAME, LIDAR_FRAME, MARKER_NS};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
