//! The "CLOUD" Engine - Binary point-cloud decoding into a slot ring
//!
//! Raw `PointCloud2` records are decoded straight into preallocated
//! position/color buffers. A [`PointCloudRing`] keeps the last N decodes
//! visible at once; each new decode is written into a private scratch slot
//! and only swapped into the ring once it is complete, so a reader never
//! sees a half-written buffer.
//!
//! ```text
//!            ┌──────── scratch ────────┐
//! message ──►│ decode (x,y,z + color)  │── swap ──► slots[cursor]
//!            └─────────────────────────┘            cursor = (cursor + 1) % N
//! ```

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use xrview_env::msgs::{PointCloud2, PointField, Time};

// ============================================================================
// OPTIONS
// ============================================================================

/// How point colors are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    /// Use color fields when present, rainbow otherwise
    #[default]
    #[serde(alias = "RGB")]
    Rgb,
    /// Always color by the rainbow scalar field
    Rainbow,
}

/// Per-topic point-cloud visualization options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudOptions {
    /// Capacity of each slot in points
    pub max_points: usize,

    /// Rendered point size in meters at viewer scale 1
    pub point_size: f32,

    pub color_mode: ColorMode,

    /// Number of slots in the ring (decodes visible at once)
    pub max_traces: usize,

    pub opacity: f32,

    pub render_order: i32,

    /// Scalar field driving the rainbow palette
    pub rainbow_field: String,

    /// Multiplier applied to the rainbow field before the hue function
    pub rainbow_scale: f32,
}

impl Default for PointCloudOptions {
    fn default() -> Self {
        Self {
            max_points: 100_000,
            point_size: 0.005,
            color_mode: ColorMode::Rgb,
            max_traces: 50,
            opacity: 1.0,
            render_order: 0,
            rainbow_field: "z".to_string(),
            rainbow_scale: 0.1,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Reasons a point-cloud message cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Point cloud has no '{0}' field")]
    MissingField(String),

    #[error("Field '{field}' has unsupported datatype {datatype}")]
    UnsupportedDatatype { field: String, datatype: u8 },
}

// ============================================================================
// DECODING
// ============================================================================

/// Triangle-wave hue function, periodic in `h` with period 1 and bounded
/// in [0, 1]. Channels sample it at phases 0, 1/3 and 2/3.
pub fn rainbow(h: f32) -> f32 {
    (6.0 * (h - h.floor() - 0.5).abs() - 1.0).clamp(0.0, 1.0)
}

fn rainbow_rgb(h: f32) -> [f32; 3] {
    [
        rainbow(h),
        rainbow(h + 1.0 / 3.0),
        rainbow(h + 2.0 / 3.0),
    ]
}

/// Reads one scalar field out of a point record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldReader {
    offset: usize,
    datatype: u8,
    size: usize,
}

impl FieldReader {
    fn new(field: &PointField) -> Result<Self, DecodeError> {
        let size = PointField::datatype_size(field.datatype).ok_or_else(|| {
            DecodeError::UnsupportedDatatype {
                field: field.name.clone(),
                datatype: field.datatype,
            }
        })?;
        Ok(Self {
            offset: field.offset as usize,
            datatype: field.datatype,
            size,
        })
    }

    fn find(msg: &PointCloud2, name: &str) -> Result<Self, DecodeError> {
        let field = msg
            .field(name)
            .ok_or_else(|| DecodeError::MissingField(name.to_string()))?;
        Self::new(field)
    }

    fn read(&self, record: &[u8], big_endian: bool) -> Option<f32> {
        let bytes = record.get(self.offset..self.offset + self.size)?;
        let value = if big_endian {
            read_scalar::<BigEndian>(bytes, self.datatype)
        } else {
            read_scalar::<LittleEndian>(bytes, self.datatype)
        };
        value.map(|v| v as f32)
    }
}

fn read_scalar<B: ByteOrder>(bytes: &[u8], datatype: u8) -> Option<f64> {
    let value = match datatype {
        PointField::INT8 => bytes[0] as i8 as f64,
        PointField::UINT8 => bytes[0] as f64,
        PointField::INT16 => B::read_i16(bytes) as f64,
        PointField::UINT16 => B::read_u16(bytes) as f64,
        PointField::INT32 => B::read_i32(bytes) as f64,
        PointField::UINT32 => B::read_u32(bytes) as f64,
        PointField::FLOAT32 => B::read_f32(bytes) as f64,
        PointField::FLOAT64 => B::read_f64(bytes),
        _ => return None,
    };
    Some(value)
}

/// Color extraction chosen once per message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColorStrategy {
    /// Three bytes starting at the `rgb` field offset, each divided by 255
    Packed { offset: usize },
    /// Separate float `r`, `g`, `b` fields
    Channels { r: usize, g: usize, b: usize },
    /// Hue from a scalar field
    Rainbow { offset: usize, scale: f32 },
}

/// Internal resolved form of [`ColorStrategy`] with datatype readers.
enum ColorReader {
    Packed(usize),
    Channels([FieldReader; 3]),
    Rainbow(FieldReader, f32),
}

impl ColorReader {
    fn resolve(msg: &PointCloud2, options: &PointCloudOptions, z: FieldReader) -> Self {
        let rainbow = || {
            let field = msg
                .field(&options.rainbow_field)
                .and_then(|f| FieldReader::new(f).ok())
                .unwrap_or(z);
            ColorReader::Rainbow(field, options.rainbow_scale)
        };

        if options.color_mode == ColorMode::Rainbow {
            return rainbow();
        }
        if let Some(rgb) = msg.field("rgb") {
            return ColorReader::Packed(rgb.offset as usize);
        }
        let channels = (
            FieldReader::find(msg, "r"),
            FieldReader::find(msg, "g"),
            FieldReader::find(msg, "b"),
        );
        if let (Ok(r), Ok(g), Ok(b)) = channels {
            return ColorReader::Channels([r, g, b]);
        }
        rainbow()
    }

    fn read(&self, record: &[u8], big_endian: bool) -> Option<[f32; 3]> {
        match self {
            ColorReader::Packed(offset) => {
                let bytes = record.get(*offset..*offset + 3)?;
                Some([
                    bytes[0] as f32 / 255.0,
                    bytes[1] as f32 / 255.0,
                    bytes[2] as f32 / 255.0,
                ])
            }
            ColorReader::Channels([r, g, b]) => Some([
                r.read(record, big_endian)?,
                g.read(record, big_endian)?,
                b.read(record, big_endian)?,
            ]),
            ColorReader::Rainbow(field, scale) => {
                Some(rainbow_rgb(field.read(record, big_endian)? * scale))
            }
        }
    }

    fn strategy(&self) -> ColorStrategy {
        match self {
            ColorReader::Packed(offset) => ColorStrategy::Packed { offset: *offset },
            ColorReader::Channels([r, g, b]) => ColorStrategy::Channels {
                r: r.offset,
                g: g.offset,
                b: b.offset,
            },
            ColorReader::Rainbow(field, scale) => ColorStrategy::Rainbow {
                offset: field.offset,
                scale: *scale,
            },
        }
    }
}

/// What a successful decode produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeSummary {
    pub draw_count: usize,
    pub color: ColorStrategy,
    /// Whether the data blob ended before the declared record count
    pub truncated: bool,
}

/// One preallocated render buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct PointCloudSlot {
    positions: Vec<[f32; 3]>,
    colors: Vec<[f32; 3]>,
    draw_count: usize,
    origin_frame: String,
    origin_pose: Isometry3<f64>,
    stamp: Time,
    visible: bool,
}

impl PointCloudSlot {
    /// Allocates a slot holding up to `capacity` points.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: vec![[0.0; 3]; capacity],
            colors: vec![[0.0; 3]; capacity],
            draw_count: 0,
            origin_frame: String::new(),
            origin_pose: Isometry3::identity(),
            stamp: Time::default(),
            visible: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.positions.len()
    }

    pub fn draw_count(&self) -> usize {
        self.draw_count
    }

    /// Positions of the drawn points.
    pub fn positions(&self) -> &[[f32; 3]] {
        &self.positions[..self.draw_count]
    }

    /// Colors of the drawn points.
    pub fn colors(&self) -> &[[f32; 3]] {
        &self.colors[..self.draw_count]
    }

    pub fn origin_frame(&self) -> &str {
        &self.origin_frame
    }

    /// Pose of the origin frame captured when the slot was filled.
    pub fn origin_pose(&self) -> Isometry3<f64> {
        self.origin_pose
    }

    pub fn stamp(&self) -> Time {
        self.stamp
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

/// Decodes `msg` into `slot`.
///
/// # Arguments
/// * `msg` - Raw point cloud
/// * `slot` - Target buffer; left untouched on error
/// * `options` - Color mode and rainbow tuning
/// * `origin_pose` - Current pose of `msg.header.frame_id`
///
/// # Returns
/// * `Ok(DecodeSummary)` - Records written and the color strategy used
/// * `Err(DecodeError)` - The layout has no usable x/y/z
pub fn decode(
    msg: &PointCloud2,
    slot: &mut PointCloudSlot,
    options: &PointCloudOptions,
    origin_pose: Isometry3<f64>,
) -> Result<DecodeSummary, DecodeError> {
    let x = FieldReader::find(msg, "x")?;
    let y = FieldReader::find(msg, "y")?;
    let z = FieldReader::find(msg, "z")?;
    let color = ColorReader::resolve(msg, options, z);

    let big_endian = msg.is_bigendian;
    let step = msg.point_step as usize;
    let count = msg.point_count().min(slot.capacity());

    let mut written = 0;
    for i in 0..count {
        let Some(record) = msg.data.get(i * step..) else {
            break;
        };
        let point = (
            x.read(record, big_endian),
            y.read(record, big_endian),
            z.read(record, big_endian),
            color.read(record, big_endian),
        );
        let (Some(px), Some(py), Some(pz), Some(rgb)) = point else {
            break;
        };
        slot.positions[i] = [px, py, pz];
        slot.colors[i] = rgb;
        written += 1;
    }

    slot.draw_count = written;
    slot.origin_frame.clone_from(&msg.header.frame_id);
    slot.origin_pose = origin_pose;
    slot.stamp = msg.header.stamp;

    Ok(DecodeSummary {
        draw_count: written,
        color: color.strategy(),
        truncated: written < count,
    })
}

// ============================================================================
// RING
// ============================================================================

/// Fixed ring of slots holding the last N decoded clouds.
#[derive(Debug)]
pub struct PointCloudRing {
    slots: Vec<PointCloudSlot>,
    scratch: PointCloudSlot,
    cursor: usize,
    options: PointCloudOptions,
    rendered_point_size: f32,
    decoded: u64,
    skipped: u64,
}

impl PointCloudRing {
    /// Allocates `max_traces` slots (at least one) of `max_points` each.
    pub fn new(options: PointCloudOptions) -> Self {
        let count = options.max_traces.max(1);
        let slots = (0..count)
            .map(|_| PointCloudSlot::with_capacity(options.max_points))
            .collect();
        Self {
            slots,
            scratch: PointCloudSlot::with_capacity(options.max_points),
            cursor: 0,
            rendered_point_size: options.point_size,
            options,
            decoded: 0,
            skipped: 0,
        }
    }

    /// Decodes a message into the next slot.
    ///
    /// Malformed layouts are logged and skipped; the ring is unchanged.
    pub fn ingest(
        &mut self,
        msg: &PointCloud2,
        origin_pose: Isometry3<f64>,
    ) -> Result<DecodeSummary, DecodeError> {
        let summary = match decode(msg, &mut self.scratch, &self.options, origin_pose) {
            Ok(summary) => summary,
            Err(e) => {
                self.skipped += 1;
                warn!(frame = %msg.header.frame_id, "Skipping point cloud: {}", e);
                return Err(e);
            }
        };

        if summary.truncated {
            debug!(
                frame = %msg.header.frame_id,
                written = summary.draw_count,
                declared = msg.point_count(),
                "Point cloud data shorter than declared"
            );
        }

        std::mem::swap(&mut self.scratch, &mut self.slots[self.cursor]);
        self.slots[self.cursor].visible = true;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.decoded += 1;
        Ok(summary)
    }

    /// Material point size compensated for the viewer's world scale.
    pub fn point_size(&self, viewer_scale: f64) -> f32 {
        if viewer_scale.abs() < f64::EPSILON {
            return self.options.point_size;
        }
        (self.options.point_size as f64 / viewer_scale) as f32
    }

    /// Recomputes the rendered point size; called once per render tick.
    pub fn update_point_size(&mut self, viewer_scale: f64) {
        self.rendered_point_size = self.point_size(viewer_scale);
    }

    /// Point size as of the last render tick.
    pub fn rendered_point_size(&self) -> f32 {
        self.rendered_point_size
    }

    /// Slots that have been filled at least once, in slot order.
    pub fn visible_slots(&self) -> impl Iterator<Item = &PointCloudSlot> {
        self.slots.iter().filter(|s| s.visible)
    }

    pub fn slot(&self, index: usize) -> Option<&PointCloudSlot> {
        self.slots.get(index)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Index the next decode will land in.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn options(&self) -> &PointCloudOptions {
        &self.options
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Total points across visible slots.
    pub fn visible_points(&self) -> usize {
        self.visible_slots().map(|s| s.draw_count()).sum()
    }
}

// ============================================================================
// ENCODING HELPERS
// ============================================================================

/// Builds a little-endian FLOAT32 `x,y,z` cloud, with a packed `rgb` field
/// when colors are given (bytes r,g,b,0).
pub fn encode_xyz(frame_id: &str, points: &[[f32; 3]], colors: Option<&[[u8; 3]]>) -> PointCloud2 {
    let mut fields = vec![
        PointField::new("x", 0, PointField::FLOAT32),
        PointField::new("y", 4, PointField::FLOAT32),
        PointField::new("z", 8, PointField::FLOAT32),
    ];
    let point_step = if colors.is_some() {
        fields.push(PointField::new("rgb", 12, PointField::FLOAT32));
        16
    } else {
        12
    };

    let mut data = vec![0u8; points.len() * point_step];
    for (i, p) in points.iter().enumerate() {
        let base = i * point_step;
        LittleEndian::write_f32(&mut data[base..base + 4], p[0]);
        LittleEndian::write_f32(&mut data[base + 4..base + 8], p[1]);
        LittleEndian::write_f32(&mut data[base + 8..base + 12], p[2]);
        if let Some(rgb) = colors.and_then(|c| c.get(i)) {
            data[base + 12..base + 15].copy_from_slice(rgb);
        }
    }

    PointCloud2 {
        header: xrview_env::msgs::Header::new(frame_id),
        height: 1,
        width: points.len() as u32,
        fields,
        is_bigendian: false,
        point_step: point_step as u32,
        row_step: data.len() as u32,
        data,
        is_dense: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn small_options(max_points: usize, max_traces: usize) -> PointCloudOptions {
        PointCloudOptions {
            max_points,
            max_traces,
            ..Default::default()
        }
    }

    fn line_cloud(n: usize) -> PointCloud2 {
        let points: Vec<[f32; 3]> = (0..n).map(|i| [i as f32, 0.0, 5.0]).collect();
        encode_xyz("laser", &points, None)
    }

    #[test]
    fn test_rainbow_anchor_values() {
        assert_relative_eq!(rainbow(0.0), 1.0);
        assert_relative_eq!(rainbow(0.5), 0.0);
        assert_relative_eq!(rainbow(0.25), 0.5);
    }

    #[test]
    fn test_packed_rgb_wins() {
        let mut msg = encode_xyz("laser", &[[1.0, 2.0, 3.0]], Some(&[[255, 0, 51]]));
        // Float channels present too; packed must still be preferred
        msg.fields.push(PointField::new("r", 0, PointField::FLOAT32));
        msg.fields.push(PointField::new("g", 4, PointField::FLOAT32));
        msg.fields.push(PointField::new("b", 8, PointField::FLOAT32));

        let mut slot = PointCloudSlot::with_capacity(4);
        let summary = decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();

        assert_eq!(summary.color, ColorStrategy::Packed { offset: 12 });
        assert_eq!(slot.positions(), &[[1.0, 2.0, 3.0]]);
        assert_relative_eq!(slot.colors()[0][0], 1.0);
        assert_relative_eq!(slot.colors()[0][1], 0.0);
        assert_relative_eq!(slot.colors()[0][2], 0.2);
    }

    #[test]
    fn test_float_channels_used_without_packed() {
        let mut msg = encode_xyz("laser", &[[0.25, 0.5, 0.75]], None);
        msg.fields.push(PointField::new("r", 0, PointField::FLOAT32));
        msg.fields.push(PointField::new("g", 4, PointField::FLOAT32));
        msg.fields.push(PointField::new("b", 8, PointField::FLOAT32));

        let mut slot = PointCloudSlot::with_capacity(4);
        let summary = decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();

        assert_eq!(summary.color, ColorStrategy::Channels { r: 0, g: 4, b: 8 });
        assert_eq!(slot.colors(), &[[0.25, 0.5, 0.75]]);
    }

    #[test]
    fn test_rainbow_fallback_uses_scaled_z() {
        let msg = encode_xyz("laser", &[[0.0, 0.0, 5.0]], None);
        let mut slot = PointCloudSlot::with_capacity(4);
        let summary = decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();

        assert!(matches!(summary.color, ColorStrategy::Rainbow { offset: 8, .. }));
        // z = 5, scale 0.1 -> hue 0.5
        assert_relative_eq!(slot.colors()[0][0], rainbow(0.5));
        assert_relative_eq!(slot.colors()[0][1], rainbow(0.5 + 1.0 / 3.0));
    }

    #[test]
    fn test_big_endian_and_int_fields() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-2i16).to_be_bytes());
        data.extend_from_slice(&7u16.to_be_bytes());
        data.extend_from_slice(&1.5f64.to_be_bytes());
        let msg = PointCloud2 {
            height: 1,
            width: 1,
            fields: vec![
                PointField::new("x", 0, PointField::INT16),
                PointField::new("y", 2, PointField::UINT16),
                PointField::new("z", 4, PointField::FLOAT64),
            ],
            is_bigendian: true,
            point_step: 12,
            row_step: 12,
            data,
            ..Default::default()
        };

        let mut slot = PointCloudSlot::with_capacity(1);
        decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
        assert_eq!(slot.positions(), &[[-2.0, 7.0, 1.5]]);
    }

    #[test]
    fn test_missing_xyz_leaves_slot_unchanged() {
        let mut ring = PointCloudRing::new(small_options(8, 2));
        ring.ingest(&line_cloud(3), Isometry3::identity()).unwrap();
        let before = ring.slot(0).cloned();

        let mut bad = line_cloud(3);
        bad.fields.retain(|f| f.name != "z");
        let err = ring.ingest(&bad, Isometry3::identity()).unwrap_err();

        assert_eq!(err, DecodeError::MissingField("z".to_string()));
        assert_eq!(ring.slot(0).cloned(), before);
        assert_eq!(ring.cursor(), 1);
        assert_eq!(ring.skipped(), 1);
    }

    #[test]
    fn test_capacity_truncates_in_record_order() {
        let mut slot = PointCloudSlot::with_capacity(4);
        let summary = decode(&line_cloud(10), &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();

        assert_eq!(summary.draw_count, 4);
        assert!(!summary.truncated);
        let xs: Vec<f32> = slot.positions().iter().map(|p| p[0]).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_short_data_truncates() {
        let mut msg = line_cloud(5);
        msg.data.truncate(12 * 3 + 6);
        let mut slot = PointCloudSlot::with_capacity(10);
        let summary = decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
        assert_eq!(summary.draw_count, 3);
        assert!(summary.truncated);
    }

    #[test]
    fn test_decode_is_idempotent() {
        let msg = encode_xyz("laser", &[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], Some(&[[1, 2, 3], [4, 5, 6]]));
        let mut slot = PointCloudSlot::with_capacity(8);
        decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
        let first = slot.clone();
        decode(&msg, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
        assert_eq!(slot, first);
    }

    #[test]
    fn test_ring_wraps_after_n_decodes() {
        let mut ring = PointCloudRing::new(small_options(16, 3));
        for n in 1..=3 {
            ring.ingest(&line_cloud(n), Isometry3::identity()).unwrap();
        }
        let slot1 = ring.slot(1).cloned();
        let slot2 = ring.slot(2).cloned();

        ring.ingest(&line_cloud(7), Isometry3::identity()).unwrap();

        assert_eq!(ring.slot(0).map(|s| s.draw_count()), Some(7));
        assert_eq!(ring.slot(1).cloned(), slot1);
        assert_eq!(ring.slot(2).cloned(), slot2);
        assert_eq!(ring.cursor(), 1);
        assert_eq!(ring.visible_slots().count(), 3);
    }

    #[test]
    fn test_slot_records_origin() {
        let mut ring = PointCloudRing::new(small_options(4, 1));
        let pose = Isometry3::translation(1.0, 2.0, 3.0);
        ring.ingest(&line_cloud(1), pose).unwrap();
        let slot = ring.slot(0).unwrap();
        assert_eq!(slot.origin_frame(), "laser");
        assert_eq!(slot.origin_pose(), pose);
        assert!(slot.is_visible());
    }

    #[test]
    fn test_point_size_compensates_scale() {
        let ring = PointCloudRing::new(small_options(1, 1));
        assert_relative_eq!(ring.point_size(2.0), 0.0025);
        assert_relative_eq!(ring.point_size(0.0), 0.005);
    }

    proptest! {
        #[test]
        fn prop_rainbow_periodic_and_bounded(h in -1000.0f32..1000.0) {
            let v = rainbow(h);
            prop_assert!((0.0..=1.0).contains(&v));
            prop_assert!((rainbow(h + 1.0) - v).abs() < 1e-3);
        }

        #[test]
        fn prop_draw_count_within_capacity(n in 0usize..64, cap in 1usize..32) {
            let mut slot = PointCloudSlot::with_capacity(cap);
            let summary = decode(&line_cloud(n), &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
            prop_assert_eq!(summary.draw_count, n.min(cap));
            prop_assert!(slot.draw_count() <= slot.capacity());
        }
    }
}
