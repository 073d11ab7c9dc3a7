//! XRView Core - Stream-to-scene synchronization for immersive robot visualization
//!
//! This library fuses asynchronous robot streams into one scene rendered at
//! display rate:
//! 1. **Transforms**: named frames resolved into smoothed poses, reference counted
//! 2. **Point Clouds**: binary records decoded into a fixed ring of render slots
//! 3. **Grids**: occupancy and cost grids rasterized into positioned textures
//! 4. **Markers**: keyed entities with an ADD/MODIFY/DELETE lifecycle and async meshes
//! 5. **Locomotion**: ballistic teleport guiding and two-handed grab navigation

pub mod xrview_tf;
pub mod xrview_cloud;
pub mod xrview_grid;
pub mod xrview_markers;
pub mod xrview_locomotion;

pub mod config;
pub mod downsample;
pub mod layers;
pub mod pose;
pub mod pose_publisher;
pub mod render_controller;
pub mod robot;
pub mod scene;
pub mod subscription;
pub mod visualizers;

#[cfg(feature = "visualization")]
pub mod visualization;

#[cfg(test)]
mod testing;

// Re-export key types for convenience
pub use config::{ConfigError, TopicConfig, ViewerConfig};
pub use render_controller::{FrameReport, RenderController};
pub use scene::{SceneNode, SceneView};
pub use visualizers::{FrameInfo, TopicVisualizer, VisualizationError, VisualizerRegistry};
pub use xrview_cloud::{DecodeError, PointCloudOptions, PointCloudRing};
pub use xrview_grid::{GridRasterizer, GridTexture};
pub use xrview_locomotion::{LocomotionEngine, ReferenceFrame, XrFrameInput};
pub use xrview_markers::{MarkerLifecycleManager, MarkerRegistry};
pub use xrview_tf::{FrameTracker, TransformCache};
