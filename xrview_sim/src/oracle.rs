//! Ground truth oracle for simulation.
//!
//! The oracle plays the robot side of the bridge:
//! - True poses of the robot frames (base driving a circle, lidar on top)
//! - Sensor stream generation (noisy point clouds, occupancy grid, joints)
//! - Marker churn (ADD / MODIFY / DELETE, with occasional mesh markers)

use std::collections::VecDeque;
use std::f64::consts::FRAC_PI_2;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use xrview_core::pose::pose_to_msg;
use xrview_core::xrview_cloud::encode_xyz;
use xrview_env::msgs::{
    ColorRGBA, Header, JointState, MapMetaData, Marker, OccupancyGrid, PointCloud2, Time,
    Vector3 as WireVector3,
};

pub const BASE_FRAME: &str = "base_link";
pub const LIDAR_FRAME: &str = "lidar";
pub const MARKER_NS: &str = "sim";

const MARKER_CUBE: i32 = 1;
const MARKER_SPHERE: i32 = 2;
const MARKER_MESH: i32 = 10;
const ACTION_ADD: i32 = 0;
const ACTION_MODIFY: i32 = 1;
const ACTION_DELETE: i32 = 2;
const ACTION_DELETEALL: i32 = 3;

/// Shape of the synthetic robot and its streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Radius of the base's circular path (m)
    pub circle_radius: f64,

    /// Angular speed along the circle (rad/s)
    pub angular_speed: f64,

    /// Lidar mount height above the base (m)
    pub lidar_height: f64,

    /// Points per simulated scan
    pub cloud_points: usize,

    /// Scan range (m)
    pub scan_range: f64,

    /// Range noise standard deviation (m)
    pub range_noise_std: f64,

    /// Occupancy grid edge in cells
    pub grid_cells: u32,

    /// Meters per grid cell
    pub grid_resolution: f32,

    pub joint_names: Vec<String>,

    /// Live markers before the oldest is deleted
    pub max_live_markers: usize,

    /// Every n-th spawned marker is a mesh (0 disables meshes)
    pub mesh_every: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            circle_radius: 3.0,
            angular_speed: 0.5,
            lidar_height: 0.4,
            cloud_points: 360,
            scan_range: 5.0,
            range_noise_std: 0.02,
            grid_cells: 40,
            grid_resolution: 0.25,
            joint_names: vec!["shoulder".into(), "elbow".into(), "wrist".into()],
            max_live_markers: 12,
            mesh_every: 4,
        }
    }
}

/// The Oracle - holds the true robot state and produces its streams.
pub struct RobotOracle {
    config: OracleConfig,
    rng: ChaCha8Rng,
    range_noise: Option<Normal<f64>>,
    time: f64,
    /// Time spent moving; drives the circle and the joints
    motion_time: f64,
    halted: bool,
    next_marker_id: i32,
    live_markers: VecDeque<i32>,
    spawned: u32,
}

impl RobotOracle {
    /// Creates an oracle with its own RNG stream.
    ///
    /// The physics seed is kept separate from the bus seed so that changing
    /// delivery faults never changes what the robot does.
    pub fn new(physics_seed: u64, config: OracleConfig) -> Self {
        let range_noise = Normal::new(0.0, config.range_noise_std).ok();
        Self {
            config,
            rng: ChaCha8Rng::seed_from_u64(physics_seed),
            range_noise,
            time: 0.0,
            motion_time: 0.0,
            halted: false,
            next_marker_id: 0,
            live_markers: VecDeque::new(),
            spawned: 0,
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Advances simulated time.
    pub fn step(&mut self, dt: f64) {
        self.time += dt;
        if !self.halted {
            self.motion_time += dt;
        }
    }

    /// Freezes the base and joints where they are; streams keep flowing.
    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    fn header(&self, frame_id: &str) -> Header {
        let mut header = Header::new(frame_id);
        header.stamp = Time::from_millis((self.time * 1000.0) as u64);
        header
    }

    // ========================================================================
    // FRAMES
    // ========================================================================

    /// True base pose in the fixed frame (Z up).
    pub fn base_pose(&self) -> Isometry3<f64> {
        let r = self.config.circle_radius;
        let phase = self.config.angular_speed * self.motion_time;
        Isometry3::from_parts(
            Translation3::new(r * phase.cos(), r * phase.sin(), 0.0),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), phase + FRAC_PI_2),
        )
    }

    /// True lidar pose in the fixed frame.
    pub fn lidar_pose(&self) -> Isometry3<f64> {
        self.base_pose() * Isometry3::translation(0.1, 0.0, self.config.lidar_height)
    }

    /// Every frame the robot publishes, with its current true pose.
    pub fn frames(&self) -> Vec<(&'static str, Isometry3<f64>)> {
        vec![(BASE_FRAME, self.base_pose()), (LIDAR_FRAME, self.lidar_pose())]
    }

    // ========================================================================
    // SENSOR STREAMS
    // ========================================================================

    /// One planar scan in the lidar frame, colored by bearing.
    pub fn point_cloud(&mut self) -> PointCloud2 {
        let n = self.config.cloud_points.max(1);
        let mut points = Vec::with_capacity(n);
        let mut colors = Vec::with_capacity(n);
        for i in 0..n {
            let bearing = i as f64 / n as f64 * std::f64::consts::TAU;
            let noise = self
                .range_noise
                .map(|dist| dist.sample(&mut self.rng))
                .unwrap_or(0.0);
            let range = self.config.scan_range + noise;
            points.push([
                (range * bearing.cos()) as f32,
                (range * bearing.sin()) as f32,
                0.0,
            ]);
            let shade = (bearing / std::f64::consts::TAU * 255.0) as u8;
            colors.push([shade, 255 - shade, 128]);
        }
        let mut cloud = encode_xyz(LIDAR_FRAME, &points, Some(colors.as_slice()));
        cloud.header = self.header(LIDAR_FRAME);
        cloud
    }

    /// A square map with walls on the border and the robot's cell occupied.
    /// The far quadrant is left unknown.
    pub fn occupancy_grid(&self, fixed_frame: &str) -> OccupancyGrid {
        let cells = self.config.grid_cells.max(1);
        let res = self.config.grid_resolution;
        let half = cells as f64 * res as f64 / 2.0;
        let base = self.base_pose().translation.vector;
        let robot_col = ((base.x + half) / res as f64).floor() as i64;
        let robot_row = ((base.y + half) / res as f64).floor() as i64;

        let mut data = Vec::with_capacity((cells * cells) as usize);
        for row in 0..cells {
            for col in 0..cells {
                let border = row == 0 || col == 0 || row == cells - 1 || col == cells - 1;
                let value = if border || (row as i64 == robot_row && col as i64 == robot_col) {
                    100
                } else if row >= cells * 3 / 4 && col >= cells * 3 / 4 {
                    -1
                } else {
                    0
                };
                data.push(value);
            }
        }

        OccupancyGrid {
            header: self.header(fixed_frame),
            info: MapMetaData {
                resolution: res,
                width: cells,
                height: cells,
                origin: pose_to_msg(&Isometry3::translation(-half, -half, 0.0)),
            },
            data,
        }
    }

    /// Joint angles as slow sine waves, phase-shifted per joint.
    pub fn joint_state(&self) -> JointState {
        JointState {
            header: self.header(BASE_FRAME),
            name: self.config.joint_names.clone(),
            position: (0..self.config.joint_names.len())
                .map(|i| self.joint_angle(i))
                .collect(),
        }
    }

    /// Expected joint angle at the current time.
    pub fn joint_angle(&self, index: usize) -> f64 {
        (self.motion_time + index as f64).sin() * 0.8
    }

    // ========================================================================
    // MARKERS
    // ========================================================================

    fn marker(&self, id: i32, marker_type: i32, action: i32) -> Marker {
        let angle = id as f64 * 0.7;
        Marker {
            header: self.header(BASE_FRAME),
            ns: MARKER_NS.to_string(),
            id,
            marker_type,
            action,
            pose: pose_to_msg(&Isometry3::translation(angle.cos(), angle.sin(), 0.5)),
            scale: WireVector3::new(0.2, 0.2, 0.2),
            color: ColorRGBA {
                r: 0.2,
                g: 0.6,
                b: 1.0,
                a: 1.0,
            },
            mesh_resource: String::new(),
            mesh_use_embedded_materials: false,
        }
    }

    /// Mesh URL used for marker `id`.
    pub fn mesh_resource(id: i32) -> String {
        format!("package://sim_robot/meshes/part_{}.stl", id)
    }

    /// One round of churn: spawn a marker, maybe nudge a live one, and
    /// delete the oldest once over capacity.
    pub fn marker_churn(&mut self) -> Vec<Marker> {
        let mut out = Vec::new();

        let id = self.next_marker_id;
        self.next_marker_id += 1;
        self.spawned += 1;
        let mesh = self.config.mesh_every > 0 && self.spawned % self.config.mesh_every == 0;
        let mut spawn = if mesh {
            let mut m = self.marker(id, MARKER_MESH, ACTION_ADD);
            m.mesh_resource = Self::mesh_resource(id);
            m
        } else if self.rng.gen_bool(0.5) {
            self.marker(id, MARKER_CUBE, ACTION_ADD)
        } else {
            self.marker(id, MARKER_SPHERE, ACTION_ADD)
        };
        spawn.color.a = self.rng.gen_range(0.5..=1.0);
        out.push(spawn);
        self.live_markers.push_back(id);

        if self.live_markers.len() > 1 && self.rng.gen_bool(0.5) {
            let pick = self.rng.gen_range(0..self.live_markers.len());
            let target = self.live_markers[pick];
            let mut modify = self.marker(target, MARKER_CUBE, ACTION_MODIFY);
            modify.scale = WireVector3::new(0.3, 0.3, 0.3);
            out.push(modify);
        }

        while self.live_markers.len() > self.config.max_live_markers {
            if let Some(oldest) = self.live_markers.pop_front() {
                out.push(self.marker(oldest, MARKER_CUBE, ACTION_DELETE));
            }
        }
        out
    }

    /// Clears every marker.
    pub fn delete_all_markers(&mut self) -> Marker {
        self.live_markers.clear();
        self.marker(0, MARKER_CUBE, ACTION_DELETEALL)
    }

    /// Number of markers the oracle believes are live.
    pub fn live_marker_count(&self) -> usize {
        self.live_markers.len()
    }

    pub fn live_marker_ids(&self) -> impl Iterator<Item = i32> + '_ {
        self.live_markers.iter().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_base_drives_circle() {
        let mut oracle = RobotOracle::new(1, OracleConfig::default());
        let start = oracle.base_pose();
        assert_relative_eq!(start.translation.vector.x, 3.0, epsilon = 1e-12);

        oracle.step(std::f64::consts::PI / 0.5);
        let half = oracle.base_pose();
        assert_relative_eq!(half.translation.vector.x, -3.0, epsilon = 1e-9);
        assert_relative_eq!(half.translation.vector.norm(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn test_halt_freezes_base() {
        let mut oracle = RobotOracle::new(1, OracleConfig::default());
        oracle.step(1.0);
        oracle.halt();
        let before = oracle.base_pose();
        oracle.step(1.0);
        assert_eq!(oracle.base_pose(), before);
        assert_relative_eq!(oracle.time(), 2.0);
    }

    #[test]
    fn test_lidar_above_base() {
        let oracle = RobotOracle::new(1, OracleConfig::default());
        let lift = oracle.lidar_pose().translation.vector.z - oracle.base_pose().translation.vector.z;
        assert_relative_eq!(lift, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn test_point_cloud_shape() {
        let mut oracle = RobotOracle::new(1, OracleConfig::default());
        let cloud = oracle.point_cloud();
        assert_eq!(cloud.point_count(), 360);
        assert_eq!(cloud.header.frame_id, LIDAR_FRAME);
        assert!(cloud.field("rgb").is_some());
    }

    #[test]
    fn test_same_seed_same_streams() {
        let mut a = RobotOracle::new(9, OracleConfig::default());
        let mut b = RobotOracle::new(9, OracleConfig::default());
        assert_eq!(a.point_cloud(), b.point_cloud());
        assert_eq!(a.marker_churn(), b.marker_churn());
    }

    #[test]
    fn test_grid_walls_and_unknown() {
        let oracle = RobotOracle::new(1, OracleConfig::default());
        let grid = oracle.occupancy_grid("map");
        assert_eq!(grid.data.len(), 1600);
        assert_eq!(grid.data[0], 100);
        assert_eq!(grid.data[39 * 40 - 2], -1);
        assert_eq!(grid.data[5 * 40 + 5], 0);
    }

    #[test]
    fn test_marker_churn_caps_live_set() {
        let mut oracle = RobotOracle::new(3, OracleConfig::default());
        let mut deletes = 0;
        let mut meshes = 0;
        for _ in 0..20 {
            for m in oracle.marker_churn() {
                if m.action == ACTION_DELETE {
                    deletes += 1;
                }
                if m.marker_type == MARKER_MESH {
                    meshes += 1;
                    assert!(m.mesh_resource.ends_with(".stl"));
                }
            }
        }
        assert_eq!(oracle.live_marker_count(), 12);
        assert_eq!(deletes, 8);
        assert_eq!(meshes, 5);
    }
}
