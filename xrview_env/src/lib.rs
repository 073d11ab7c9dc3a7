//! XRView Environment Abstraction Layer
//!
//! This crate holds everything the XRView engines consume from the outside
//! world, so the same engine code runs against a live robot bridge in
//! **Production** (tokio) and against the in-memory bus in **Simulation**.
//!
//! # Core Concept: Streams In, Snapshots Out
//!
//! The engines never own a socket. They see:
//! - Topics (`TopicTransport::subscribe()` with a handler, `publish()`)
//! - Transforms (`TransformSource::subscribe_frame()` by frame name)
//! - Assets (`MeshLoader::load()`, asynchronous)
//! - Time and task spawning (`SceneContext`)
//!
//! Handlers run to completion on the caller's context; the only delivery
//! guarantee is "newest message wins" when the queue depth is 1.
//!
//! # Example
//!
//! ```ignore
//! use xrview_env::{MessageKind, SubscribeOptions, TopicTransport};
//!
//! let id = transport.subscribe(
//!     "/map",
//!     MessageKind::OccupancyGrid,
//!     SubscribeOptions::default(),
//!     Box::new(|msg| println!("{:?}", msg.kind())),
//! )?;
//! transport.unsubscribe(id);
//! ```

mod context;
mod transport;
mod types;
mod loader;
mod error;
mod tokio_impl;
pub mod msgs;

pub use context::SceneContext;
pub use transport::{TopicTransport, TransformSource, MessageHandler, TransformHandler};
pub use types::{Compression, SubscribeOptions, SubscriptionId};
pub use loader::{MeshAsset, MeshFormat, MeshLoader};
pub use msgs::{Message, MessageKind};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
