//! Viewer configuration.
//!
//! Loaded from JSON by the embedding application (or the sim CLI) and
//! handed to the render controller; the engines never read files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use xrview_env::{MessageKind, SubscribeOptions};

use crate::xrview_cloud::{ColorMode, PointCloudOptions};
use crate::xrview_grid::{ColorScheme, GridOptions};
use crate::xrview_tf::TransformCacheConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Transform tree settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TfConfig {
    /// Root frame every pose is expressed in
    pub fixed_frame: String,
    pub angular_threshold: f64,
    pub translation_threshold: f64,
}

impl Default for TfConfig {
    fn default() -> Self {
        Self {
            fixed_frame: "map".to_string(),
            angular_threshold: 0.01,
            translation_threshold: 0.01,
        }
    }
}

impl TfConfig {
    pub fn cache_config(&self) -> TransformCacheConfig {
        TransformCacheConfig {
            angular_threshold: self.angular_threshold,
            translation_threshold: self.translation_threshold,
            ..TransformCacheConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    pub joint_states_topics: Vec<String>,
    pub base_frame: String,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            joint_states_topics: vec!["/joint_states".to_string()],
            base_frame: "base_link".to_string(),
        }
    }
}

/// Static ground grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub enabled: bool,
    pub cell_count: u32,
    pub cell_size: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cell_count: 20,
            cell_size: 1.0,
        }
    }
}

/// Optional per-topic visualization overrides. Unset fields keep the
/// visualizer's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicVisualizationOptions {
    pub max_points: Option<usize>,
    pub point_size: Option<f32>,
    pub color_mode: Option<ColorMode>,
    pub max_traces: Option<usize>,
    pub opacity: Option<f32>,
    pub render_order: Option<i32>,
    pub rainbow_field: Option<String>,
    pub rainbow_scale: Option<f32>,
    pub color_scheme: Option<ColorScheme>,
    pub show_unknown: Option<bool>,
    pub unknown_color: Option<u32>,
    pub z_offset: Option<f64>,
    /// Axes length for pose-like topics
    pub axes_size: Option<f64>,
}

impl TopicVisualizationOptions {
    pub fn point_cloud(&self) -> PointCloudOptions {
        let d = PointCloudOptions::default();
        PointCloudOptions {
            max_points: self.max_points.unwrap_or(d.max_points),
            point_size: self.point_size.unwrap_or(d.point_size),
            color_mode: self.color_mode.unwrap_or(d.color_mode),
            max_traces: self.max_traces.unwrap_or(d.max_traces),
            opacity: self.opacity.unwrap_or(d.opacity),
            render_order: self.render_order.unwrap_or(d.render_order),
            rainbow_field: self.rainbow_field.clone().unwrap_or(d.rainbow_field),
            rainbow_scale: self.rainbow_scale.unwrap_or(d.rainbow_scale),
        }
    }

    pub fn grid(&self) -> GridOptions {
        let d = GridOptions::default();
        GridOptions {
            color_scheme: self.color_scheme.unwrap_or(d.color_scheme),
            show_unknown: self.show_unknown.unwrap_or(d.show_unknown),
            unknown_color: self.unknown_color.unwrap_or(d.unknown_color),
            opacity: self.opacity.unwrap_or(d.opacity),
            render_order: self.render_order.unwrap_or(d.render_order),
            z_offset: self.z_offset.or(d.z_offset),
        }
    }
}

/// One visualized topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    /// Wire type tag, e.g. `sensor_msgs/msg/PointCloud2`
    pub message_type: String,
    #[serde(default)]
    pub options: TopicVisualizationOptions,
}

impl TopicConfig {
    pub fn new(name: &str, kind: MessageKind) -> Self {
        Self {
            name: name.to_string(),
            message_type: kind.type_name().to_string(),
            options: TopicVisualizationOptions::default(),
        }
    }

    pub fn kind(&self) -> Result<MessageKind, ConfigError> {
        self.message_type
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown message type '{}'", self.message_type)))
    }

    /// Transport options for this topic's message kind.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        match self.kind() {
            Ok(MessageKind::PointCloud2) => SubscribeOptions::sensor_stream(),
            _ => SubscribeOptions::default(),
        }
    }
}

/// Publishing of headset/controller poses back to the robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VrPublisherConfig {
    pub enabled: bool,
    pub headset_topic: String,
    pub left_controller_topic: String,
    pub right_controller_topic: String,
    /// Hz
    pub publish_rate: f64,
}

impl Default for VrPublisherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            headset_topic: "/vr/headset".to_string(),
            left_controller_topic: "/vr/left_controller".to_string(),
            right_controller_topic: "/vr/right_controller".to_string(),
            publish_rate: 30.0,
        }
    }
}

/// Top-level viewer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub tf: TfConfig,
    pub robot: RobotConfig,
    pub grid: GridConfig,
    pub topics: Vec<TopicConfig>,
    pub vr_publisher: VrPublisherConfig,
    /// Base URL that `package://` mesh resources resolve against
    pub package_base_url: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            tf: TfConfig::default(),
            robot: RobotConfig::default(),
            grid: GridConfig::default(),
            topics: Vec::new(),
            vr_publisher: VrPublisherConfig::default(),
            package_base_url: "https://localhost:8080".to_string(),
        }
    }
}

impl ViewerConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ViewerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tf.fixed_frame.is_empty() {
            return Err(ConfigError::Invalid("tf.fixed_frame is empty".into()));
        }
        if self.tf.angular_threshold < 0.0 || self.tf.translation_threshold < 0.0 {
            return Err(ConfigError::Invalid("tf thresholds must be non-negative".into()));
        }
        if self.grid.cell_size <= 0.0 {
            return Err(ConfigError::Invalid("grid.cell_size must be positive".into()));
        }
        if self.vr_publisher.enabled && self.vr_publisher.publish_rate <= 0.0 {
            return Err(ConfigError::Invalid("vr_publisher.publish_rate must be positive".into()));
        }
        for topic in &self.topics {
            topic.kind()?;
        }
        Ok(())
    }
}
