//! XRView Rerun Demo
//!
//! Decodes a synthetic spinning lidar scan into a point cloud ring, previews
//! a teleport guide arc and logs both to Rerun.
//!
//! Run with `cargo run -p xrview_core --example rerun_demo --features visualization`.

use std::f64::consts::FRAC_PI_6;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use xrview_core::config::GridConfig;
use xrview_core::layers::ground_grid_lines;
use xrview_core::visualization::RerunVisualizer;
use xrview_core::xrview_cloud::encode_xyz;
use xrview_core::xrview_locomotion::{Hand, LocomotionConfig, LocomotionEngine, TrackedInput};
use xrview_core::{PointCloudOptions, PointCloudRing, XrFrameInput};

fn scan(frame: usize) -> Vec<[f32; 3]> {
    let spin = frame as f32 * 0.05;
    (0..720)
        .map(|i| {
            let angle = i as f32 / 720.0 * std::f32::consts::TAU + spin;
            let range = 3.0 + (angle * 4.0).sin() * 0.5;
            [range * angle.cos(), range * angle.sin(), 0.4]
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("XRView Rerun Demo");

    let viz = RerunVisualizer::new("XRView Demo")?;
    viz.log_ground_grid(&ground_grid_lines(&GridConfig::default()))?;

    let mut ring = PointCloudRing::new(PointCloudOptions::default());
    let mut locomotion = LocomotionEngine::new(LocomotionConfig::default());

    let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), FRAC_PI_6);
    let input = XrFrameInput {
        head: Isometry3::translation(0.0, 1.6, 0.0),
        controllers: [
            None,
            Some(TrackedInput::controller(Isometry3::from_parts(
                Translation3::new(0.2, 1.4, -0.3),
                pitch,
            ))),
        ],
    };
    locomotion.select_start(Hand::Right, &input);

    for frame in 0..100 {
        let cloud = encode_xyz("lidar", &scan(frame), None);
        ring.ingest(&cloud, Isometry3::identity())?;
        viz.log_point_cloud("/lidar/points", &ring)?;

        if let Some(preview) = locomotion.tick(&input).preview {
            viz.log_guide(&preview)?;
        }
        viz.log_reference(locomotion.reference())?;
    }

    println!("Done: {} scans decoded", ring.decoded());
    Ok(())
}
