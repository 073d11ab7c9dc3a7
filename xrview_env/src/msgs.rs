//! Wire message shapes delivered by the robot bridge.
//!
//! Field names follow the upstream robot message definitions so that JSON
//! payloads from the bridge deserialize without renaming.

use serde::{Deserialize, Serialize};

// ============================================================================
// COMMON
// ============================================================================

/// Timestamp as seconds + nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Time {
    pub sec: i32,
    pub nanosec: u32,
}

impl Time {
    /// Builds a stamp from milliseconds since the epoch.
    pub fn from_millis(millis: u64) -> Self {
        Self {
            sec: (millis / 1000) as i32,
            nanosec: ((millis % 1000) * 1_000_000) as u32,
        }
    }

    /// Returns the stamp as fractional seconds.
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nanosec as f64 * 1e-9
    }
}

/// Standard message header.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Header {
    pub stamp: Time,
    pub frame_id: String,
}

impl Header {
    pub fn new(frame_id: impl Into<String>) -> Self {
        Self {
            stamp: Time::default(),
            frame_id: frame_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0, w: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Point,
    pub orientation: Quaternion,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vector3,
    pub rotation: Quaternion,
}

/// Color with float channels in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ColorRGBA {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

// ============================================================================
// TRANSFORMS & POSES
// ============================================================================

/// Pose of `child_frame_id` relative to `header.frame_id` (the fixed frame).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformStamped {
    pub header: Header,
    pub child_frame_id: String,
    pub transform: Transform,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseStamped {
    pub header: Header,
    pub pose: Pose,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PoseWithCovariance {
    pub pose: Pose,
    #[serde(default)]
    pub covariance: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Odometry {
    pub header: Header,
    #[serde(default)]
    pub child_frame_id: String,
    pub pose: PoseWithCovariance,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Path {
    pub header: Header,
    pub poses: Vec<PoseStamped>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JointState {
    pub header: Header,
    pub name: Vec<String>,
    pub position: Vec<f64>,
}

// ============================================================================
// POINT CLOUDS
// ============================================================================

/// Layout description of one field inside each point record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointField {
    pub name: String,
    pub offset: u32,
    pub datatype: u8,
    pub count: u32,
}

impl PointField {
    pub const INT8: u8 = 1;
    pub const UINT8: u8 = 2;
    pub const INT16: u8 = 3;
    pub const UINT16: u8 = 4;
    pub const INT32: u8 = 5;
    pub const UINT32: u8 = 6;
    pub const FLOAT32: u8 = 7;
    pub const FLOAT64: u8 = 8;

    pub fn new(name: impl Into<String>, offset: u32, datatype: u8) -> Self {
        Self {
            name: name.into(),
            offset,
            datatype,
            count: 1,
        }
    }

    /// Size in bytes of one element of this field's datatype.
    pub fn datatype_size(datatype: u8) -> Option<usize> {
        match datatype {
            Self::INT8 | Self::UINT8 => Some(1),
            Self::INT16 | Self::UINT16 => Some(2),
            Self::INT32 | Self::UINT32 | Self::FLOAT32 => Some(4),
            Self::FLOAT64 => Some(8),
            _ => None,
        }
    }
}

/// A collection of N-dimensional points stored as a binary blob whose
/// layout is described by `fields`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointCloud2 {
    pub header: Header,
    pub height: u32,
    pub width: u32,
    pub fields: Vec<PointField>,
    pub is_bigendian: bool,
    pub point_step: u32,
    pub row_step: u32,
    pub data: Vec<u8>,
    #[serde(default)]
    pub is_dense: bool,
}

impl PointCloud2 {
    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&PointField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Number of point records declared by the header.
    pub fn point_count(&self) -> usize {
        (self.width as usize).saturating_mul(self.height as usize)
    }
}

// ============================================================================
// GRIDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MapMetaData {
    /// Meters per cell
    pub resolution: f32,
    pub width: u32,
    pub height: u32,
    /// Pose of cell (0, 0) in the grid's frame
    pub origin: Pose,
}

/// Row-major grid of occupancy probabilities in [0, 100], -1 = unknown.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OccupancyGrid {
    pub header: Header,
    pub info: MapMetaData,
    pub data: Vec<i8>,
}

// ============================================================================
// MARKERS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Marker {
    pub header: Header,
    pub ns: String,
    pub id: i32,
    #[serde(rename = "type")]
    pub marker_type: i32,
    pub action: i32,
    pub pose: Pose,
    pub scale: Vector3,
    pub color: ColorRGBA,
    #[serde(default)]
    pub mesh_resource: String,
    #[serde(default)]
    pub mesh_use_embedded_materials: bool,
}

// ============================================================================
// ENVELOPE
// ============================================================================

/// Message type tags, as spelled by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    PointCloud2,
    OccupancyGrid,
    Marker,
    PoseStamped,
    Odometry,
    Path,
    JointState,
    TransformStamped,
}

impl MessageKind {
    /// Returns a list of all kinds.
    pub fn all() -> Vec<MessageKind> {
        vec![
            MessageKind::PointCloud2,
            MessageKind::OccupancyGrid,
            MessageKind::Marker,
            MessageKind::PoseStamped,
            MessageKind::Odometry,
            MessageKind::Path,
            MessageKind::JointState,
            MessageKind::TransformStamped,
        ]
    }

    /// Returns the wire type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageKind::PointCloud2 => "sensor_msgs/msg/PointCloud2",
            MessageKind::OccupancyGrid => "nav_msgs/msg/OccupancyGrid",
            MessageKind::Marker => "visualization_msgs/msg/Marker",
            MessageKind::PoseStamped => "geometry_msgs/msg/PoseStamped",
            MessageKind::Odometry => "nav_msgs/msg/Odometry",
            MessageKind::Path => "nav_msgs/msg/Path",
            MessageKind::JointState => "sensor_msgs/msg/JointState",
            MessageKind::TransformStamped => "geometry_msgs/msg/TransformStamped",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = crate::EnvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both "pkg/msg/Type" and the older "pkg/Type" spelling
        let normalized = s.replace("/msg/", "/");
        MessageKind::all()
            .into_iter()
            .find(|kind| kind.type_name().replace("/msg/", "/") == normalized)
            .ok_or_else(|| crate::EnvError::UnknownMessageType(s.to_string()))
    }
}

/// A decoded message of any supported kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    PointCloud2(PointCloud2),
    OccupancyGrid(OccupancyGrid),
    Marker(Marker),
    PoseStamped(PoseStamped),
    Odometry(Odometry),
    Path(Path),
    JointState(JointState),
    TransformStamped(TransformStamped),
}

impl Message {
    /// Returns the type tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::PointCloud2(_) => MessageKind::PointCloud2,
            Message::OccupancyGrid(_) => MessageKind::OccupancyGrid,
            Message::Marker(_) => MessageKind::Marker,
            Message::PoseStamped(_) => MessageKind::PoseStamped,
            Message::Odometry(_) => MessageKind::Odometry,
            Message::Path(_) => MessageKind::Path,
            Message::JointState(_) => MessageKind::JointState,
            Message::TransformStamped(_) => MessageKind::TransformStamped,
        }
    }

    /// Returns the header's frame id.
    pub fn frame_id(&self) -> &str {
        match self {
            Message::PointCloud2(m) => &m.header.frame_id,
            Message::OccupancyGrid(m) => &m.header.frame_id,
            Message::Marker(m) => &m.header.frame_id,
            Message::PoseStamped(m) => &m.header.frame_id,
            Message::Odometry(m) => &m.header.frame_id,
            Message::Path(m) => &m.header.frame_id,
            Message::JointState(m) => &m.header.frame_id,
            Message::TransformStamped(m) => &m.header.frame_id,
        }
    }

    /// Decodes a JSON payload of the given kind, as sent by the bridge.
    pub fn from_json(kind: MessageKind, payload: &str) -> Result<Self, crate::EnvError> {
        let message = match kind {
            MessageKind::PointCloud2 => Message::PointCloud2(serde_json::from_str(payload)?),
            MessageKind::OccupancyGrid => Message::OccupancyGrid(serde_json::from_str(payload)?),
            MessageKind::Marker => Message::Marker(serde_json::from_str(payload)?),
            MessageKind::PoseStamped => Message::PoseStamped(serde_json::from_str(payload)?),
            MessageKind::Odometry => Message::Odometry(serde_json::from_str(payload)?),
            MessageKind::Path => Message::Path(serde_json::from_str(payload)?),
            MessageKind::JointState => Message::JointState(serde_json::from_str(payload)?),
            MessageKind::TransformStamped => {
                Message::TransformStamped(serde_json::from_str(payload)?)
            }
        };
        Ok(message)
    }
}
