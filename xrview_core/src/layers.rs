//! Render-side state for the simpler topic visualizations and the static
//! ground grid.

use nalgebra::{Isometry3, Vector3};

use crate::config::GridConfig;
use crate::pose::{pose_from_msg, SmoothedPose, DEFAULT_BLEND};
use crate::xrview_grid::{GridRasterizer, GridTexture};
use crate::xrview_tf::FrameTracker;
use xrview_env::msgs::{OccupancyGrid, Path, Pose};

/// Height added to path points so they do not z-fight with the floor.
pub const PATH_LIFT: f64 = 0.01;

/// Latest occupancy grid texture, mounted in its header frame.
#[derive(Debug)]
pub struct GridLayer {
    rasterizer: GridRasterizer,
    tracker: FrameTracker,
    texture: Option<GridTexture>,
    frame_pose: Isometry3<f64>,
    updates: u64,
}

impl GridLayer {
    pub fn new(rasterizer: GridRasterizer, tracker: FrameTracker) -> Self {
        Self {
            rasterizer,
            tracker,
            texture: None,
            frame_pose: Isometry3::identity(),
            updates: 0,
        }
    }

    /// Replaces the texture; a grid that cannot be rasterized keeps the
    /// previous one.
    pub fn on_grid(&mut self, grid: &OccupancyGrid) {
        let Some(texture) = self.rasterizer.rasterize(grid) else {
            return;
        };
        self.tracker.track(&grid.header.frame_id);
        self.texture = Some(texture);
        self.updates += 1;
    }

    pub fn on_frame(&mut self) {
        self.frame_pose = self.tracker.pose();
    }

    pub fn texture(&self) -> Option<&GridTexture> {
        self.texture.as_ref()
    }

    /// Plane pose in the fixed frame.
    pub fn world_placement(&self) -> Option<Isometry3<f64>> {
        self.texture.as_ref().map(|t| self.frame_pose * t.placement)
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

/// Coordinate axes following a smoothed pose (PoseStamped, Odometry).
#[derive(Debug)]
pub struct AxesLayer {
    tracker: FrameTracker,
    pose: SmoothedPose,
    frame_pose: Isometry3<f64>,
    pub axes_size: f64,
}

impl AxesLayer {
    pub fn new(tracker: FrameTracker, axes_size: f64) -> Self {
        Self {
            tracker,
            pose: SmoothedPose::new(DEFAULT_BLEND),
            frame_pose: Isometry3::identity(),
            axes_size,
        }
    }

    pub fn on_pose(&mut self, frame_id: &str, pose: &Pose) {
        self.tracker.track(frame_id);
        self.pose.set_target(pose_from_msg(pose));
    }

    pub fn on_frame(&mut self) {
        self.pose.tick();
        self.frame_pose = self.tracker.pose();
    }

    /// Smoothed pose in its header frame.
    pub fn local_pose(&self) -> Isometry3<f64> {
        self.pose.rendered()
    }

    pub fn world_pose(&self) -> Isometry3<f64> {
        self.frame_pose * self.pose.rendered()
    }

    pub fn has_pose(&self) -> bool {
        self.pose.has_observation()
    }
}

/// Polyline through the positions of a path message.
#[derive(Debug)]
pub struct PathLayer {
    tracker: FrameTracker,
    points: Vec<Vector3<f64>>,
    frame_pose: Isometry3<f64>,
}

impl PathLayer {
    pub fn new(tracker: FrameTracker) -> Self {
        Self {
            tracker,
            points: Vec::new(),
            frame_pose: Isometry3::identity(),
        }
    }

    pub fn on_path(&mut self, path: &Path) {
        self.tracker.track(&path.header.frame_id);
        self.points = path
            .poses
            .iter()
            .map(|p| {
                let q = &p.pose.position;
                Vector3::new(q.x, q.y, q.z + PATH_LIFT)
            })
            .collect();
    }

    pub fn on_frame(&mut self) {
        self.frame_pose = self.tracker.pose();
    }

    /// Points in the path's header frame.
    pub fn points(&self) -> &[Vector3<f64>] {
        &self.points
    }

    pub fn world_points(&self) -> Vec<Vector3<f64>> {
        self.points
            .iter()
            .map(|p| self.frame_pose.transform_vector(p) + self.frame_pose.translation.vector)
            .collect()
    }
}

/// Line segments of a square ground grid in the Y-up viewer frame,
/// centered on the origin: `cell_count + 1` lines along each axis.
pub fn ground_grid_lines(config: &GridConfig) -> Vec<[Vector3<f64>; 2]> {
    if !config.enabled || config.cell_count == 0 {
        return Vec::new();
    }
    let half = config.cell_count as f64 * config.cell_size / 2.0;
    let mut lines = Vec::with_capacity(2 * (config.cell_count as usize + 1));
    for i in 0..=config.cell_count {
        let k = -half + i as f64 * config.cell_size;
        lines.push([Vector3::new(-half, 0.0, k), Vector3::new(half, 0.0, k)]);
        lines.push([Vector3::new(k, 0.0, -half), Vector3::new(k, 0.0, half)]);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ground_grid_line_count() {
        let lines = ground_grid_lines(&GridConfig::default());
        assert_eq!(lines.len(), 42);
        assert_eq!(lines[0][0], Vector3::new(-10.0, 0.0, -10.0));
        assert_eq!(lines[41][1], Vector3::new(10.0, 0.0, 10.0));
    }

    #[test]
    fn test_disabled_ground_grid_is_empty() {
        let config = GridConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(ground_grid_lines(&config).is_empty());
    }
}
