//! Voxel-grid downsampling of point clouds.

use std::collections::BTreeMap;

use nalgebra::Isometry3;
use thiserror::Error;
use tracing::debug;
use xrview_env::msgs::PointCloud2;

use crate::xrview_cloud::{decode, encode_xyz, ColorStrategy, DecodeError, PointCloudOptions, PointCloudSlot};

/// Default voxel edge length in meters.
pub const DEFAULT_LEAF_SIZE: f64 = 0.05;

#[derive(Debug, Error)]
pub enum DownsampleError {
    #[error("Leaf size must be positive and finite, got {0}")]
    InvalidLeafSize(f64),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[derive(Default)]
struct Voxel {
    sum: [f64; 3],
    color: [f64; 3],
    count: u32,
}

/// Replaces every occupied voxel with the mean of its points (and colors).
///
/// The output is a little-endian FLOAT32 `x,y,z` cloud in the input's
/// frame, with a packed `rgb` field when the input carried color. Points
/// with non-finite coordinates are dropped.
pub fn voxel_downsample(cloud: &PointCloud2, leaf_size: f64) -> Result<PointCloud2, DownsampleError> {
    if !(leaf_size > 0.0 && leaf_size.is_finite()) {
        return Err(DownsampleError::InvalidLeafSize(leaf_size));
    }

    // Size by the records actually present; the declared size may be inflated
    let present = cloud.data.len() / (cloud.point_step.max(1) as usize);
    let mut slot = PointCloudSlot::with_capacity(cloud.point_count().min(present));
    let summary = decode(cloud, &mut slot, &PointCloudOptions::default(), Isometry3::identity())?;
    let colored = !matches!(summary.color, ColorStrategy::Rainbow { .. });

    let mut voxels: BTreeMap<(i64, i64, i64), Voxel> = BTreeMap::new();
    for (p, c) in slot.positions().iter().zip(slot.colors()) {
        if !p.iter().all(|v| v.is_finite()) {
            continue;
        }
        let key = (
            (p[0] as f64 / leaf_size).floor() as i64,
            (p[1] as f64 / leaf_size).floor() as i64,
            (p[2] as f64 / leaf_size).floor() as i64,
        );
        let voxel = voxels.entry(key).or_default();
        for i in 0..3 {
            voxel.sum[i] += p[i] as f64;
            voxel.color[i] += c[i] as f64;
        }
        voxel.count += 1;
    }

    let mut points = Vec::with_capacity(voxels.len());
    let mut colors = Vec::with_capacity(voxels.len());
    for voxel in voxels.values() {
        let n = voxel.count as f64;
        points.push(voxel.sum.map(|s| (s / n) as f32));
        colors.push(voxel.color.map(|c| (c / n * 255.0).round().clamp(0.0, 255.0) as u8));
    }
    debug!(
        input = summary.draw_count,
        output = points.len(),
        leaf_size,
        "Voxel downsampled point cloud"
    );

    let mut out = encode_xyz(
        &cloud.header.frame_id,
        &points,
        colored.then_some(colors.as_slice()),
    );
    out.header.stamp = cloud.header.stamp;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn decoded(cloud: &PointCloud2) -> PointCloudSlot {
        let mut slot = PointCloudSlot::with_capacity(cloud.point_count());
        decode(cloud, &mut slot, &PointCloudOptions::default(), Isometry3::identity()).unwrap();
        slot
    }

    #[test]
    fn test_points_in_one_voxel_are_averaged() {
        let cloud = encode_xyz(
            "lidar",
            &[[0.01, 0.01, 0.01], [0.03, 0.03, 0.03], [1.0, 1.0, 1.0]],
            Some(&[[255, 0, 0], [0, 0, 255], [0, 255, 0]]),
        );
        let out = voxel_downsample(&cloud, DEFAULT_LEAF_SIZE).unwrap();
        assert_eq!(out.point_count(), 2);
        assert_eq!(out.header.frame_id, "lidar");
        assert!(out.field("rgb").is_some());

        let slot = decoded(&out);
        assert_relative_eq!(slot.positions()[0][0], 0.02, epsilon = 1e-6);
        // (255 + 0) / 2 rounds to 128
        assert_relative_eq!(slot.colors()[0][0], 128.0 / 255.0, epsilon = 1e-6);
        assert_relative_eq!(slot.colors()[0][2], 128.0 / 255.0, epsilon = 1e-6);
        assert_relative_eq!(slot.positions()[1][1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_uncolored_input_stays_uncolored() {
        let cloud = encode_xyz("lidar", &[[0.0, 0.0, 0.0], [-0.01, 0.0, 0.0]], None);
        let out = voxel_downsample(&cloud, 0.05).unwrap();
        // -0.01 falls in voxel -1, 0.0 in voxel 0
        assert_eq!(out.point_count(), 2);
        assert!(out.field("rgb").is_none());
    }

    #[test]
    fn test_non_finite_points_dropped() {
        let cloud = encode_xyz("lidar", &[[f32::NAN, 0.0, 0.0], [0.0, 0.0, 0.0]], None);
        assert_eq!(voxel_downsample(&cloud, 0.05).unwrap().point_count(), 1);
    }

    #[test]
    fn test_inflated_dimensions_use_present_records() {
        let mut cloud = encode_xyz("lidar", &[[0.5, 0.5, 0.5]], None);
        cloud.width = u32::MAX;
        cloud.height = u32::MAX;
        let out = voxel_downsample(&cloud, 0.05).unwrap();
        assert_eq!(out.point_count(), 1);
        assert_relative_eq!(decoded(&out).positions()[0][2], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_invalid_leaf_size() {
        let cloud = encode_xyz("lidar", &[[0.0, 0.0, 0.0]], None);
        assert!(matches!(
            voxel_downsample(&cloud, 0.0),
            Err(DownsampleError::InvalidLeafSize(_))
        ));
    }
}
