//! Visualization module for XRView using Rerun.io
//!
//! This module mirrors the immersive scene into a Rerun recording:
//! - Decoded point cloud slots, placed at their origin poses
//! - Occupancy grid textures on their planes
//! - Marker entities
//! - The teleport guide arc and the viewer reference frame
//!
//! Enable with the `visualization` feature flag.

use nalgebra::{Isometry3, Vector3};
use rerun::{RecordingStream, RecordingStreamBuilder};

use crate::layers::{AxesLayer, GridLayer, PathLayer};
use crate::scene::{lock, SceneNode, SceneView};
use crate::xrview_cloud::PointCloudRing;
use crate::xrview_locomotion::{GuidePreview, ReferenceFrame};
use crate::xrview_markers::{Geometry, MarkerRegistry};

fn f32x3(v: &Vector3<f64>) -> [f32; 3] {
    [v.x as f32, v.y as f32, v.z as f32]
}

fn transform(pose: &Isometry3<f64>) -> rerun::Transform3D {
    let q = pose.rotation.quaternion();
    rerun::Transform3D::from_translation_rotation(
        f32x3(&pose.translation.vector),
        rerun::Quaternion::from_xyzw([q.i as f32, q.j as f32, q.k as f32, q.w as f32]),
    )
}

fn entity_path(topic: &str) -> String {
    format!("world/topics/{}", topic.trim_start_matches('/').replace('/', "_"))
}

/// Rerun-based mirror of the XRView scene
pub struct RerunVisualizer {
    rec: RecordingStream,
}

impl RerunVisualizer {
    /// Create a new visualizer that spawns the Rerun viewer
    pub fn new(app_id: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let rec = RecordingStreamBuilder::new(app_id).spawn()?;

        // The viewer frame is Y-up
        rec.log_static("world", &rerun::ViewCoordinates::RIGHT_HAND_Y_UP())?;

        Ok(Self { rec })
    }

    /// Create a visualizer that saves to a file
    pub fn new_to_file(app_id: &str, path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let rec = RecordingStreamBuilder::new(app_id).save(path)?;
        rec.log_static("world", &rerun::ViewCoordinates::RIGHT_HAND_Y_UP())?;
        Ok(Self { rec })
    }

    /// Log every live node, skipping nodes whose owner is gone
    pub fn log_scene(&self, nodes: &[SceneNode]) -> Result<(), Box<dyn std::error::Error>> {
        for node in nodes {
            match &node.view {
                SceneView::PointCloud(weak) => {
                    if let Some(ring) = weak.upgrade() {
                        self.log_point_cloud(&node.topic, &lock(&ring))?;
                    }
                }
                SceneView::Grid(weak) => {
                    if let Some(layer) = weak.upgrade() {
                        self.log_grid(&node.topic, &lock(&layer))?;
                    }
                }
                SceneView::Markers(weak) => {
                    if let Some(registry) = weak.upgrade() {
                        self.log_markers(&node.topic, &lock(&registry))?;
                    }
                }
                SceneView::Axes(weak) => {
                    if let Some(layer) = weak.upgrade() {
                        self.log_axes(&node.topic, &lock(&layer))?;
                    }
                }
                SceneView::Path(weak) => {
                    if let Some(layer) = weak.upgrade() {
                        self.log_path(&node.topic, &lock(&layer))?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Log the visible slots of a point cloud ring
    pub fn log_point_cloud(
        &self,
        topic: &str,
        ring: &PointCloudRing,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let base = entity_path(topic);
        for index in 0..ring.slot_count() {
            let Some(slot) = ring.slot(index).filter(|s| s.is_visible()) else {
                continue;
            };
            let path = format!("{}/slot_{}", base, index);
            self.rec.log(path.as_str(), &transform(&slot.origin_pose()))?;

            let colors: Vec<[u8; 3]> = slot
                .colors()
                .iter()
                .map(|c| c.map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8))
                .collect();
            self.rec.log(
                format!("{}/points", path),
                &rerun::Points3D::new(slot.positions().iter().copied())
                    .with_colors(colors)
                    .with_radii([ring.rendered_point_size() / 2.0]),
            )?;
        }
        Ok(())
    }

    /// Log a grid texture on its plane
    pub fn log_grid(&self, topic: &str, layer: &GridLayer) -> Result<(), Box<dyn std::error::Error>> {
        let (Some(texture), Some(placement)) = (layer.texture(), layer.world_placement()) else {
            return Ok(());
        };
        let path = entity_path(topic);
        self.rec.log(path.as_str(), &transform(&placement))?;
        self.rec.log(
            format!("{}/texture", path),
            &rerun::Image::from_rgba32([texture.width, texture.height], texture.pixels.clone()),
        )?;
        Ok(())
    }

    /// Log every ready marker entity
    pub fn log_markers(
        &self,
        topic: &str,
        registry: &MarkerRegistry,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let base = entity_path(topic);
        for entity in registry.entities() {
            let a = &entity.appearance;
            let path = format!("{}/{}", base, entity.key);
            let color = [
                (a.color[0] * 255.0) as u8,
                (a.color[1] * 255.0) as u8,
                (a.color[2] * 255.0) as u8,
                (a.opacity.clamp(0.0, 1.0) * 255.0) as u8,
            ];
            self.rec.log(path.as_str(), &transform(&a.pose))?;
            match &entity.geometry {
                Geometry::Box | Geometry::Cylinder { .. } => {
                    self.rec.log(
                        format!("{}/shape", path),
                        &rerun::Boxes3D::from_sizes([f32x3(&a.scale)])
                            .with_colors([color])
                            .with_labels([entity.key.to_string()]),
                    )?;
                }
                Geometry::Sphere { radius } => {
                    let half = a.scale * *radius;
                    self.rec.log(
                        format!("{}/shape", path),
                        &rerun::Ellipsoids3D::from_half_sizes([f32x3(&half)]).with_colors([color]),
                    )?;
                }
                Geometry::Mesh(asset) => {
                    self.rec.log(
                        format!("{}/shape", path),
                        &rerun::Mesh3D::new(asset.positions.iter().copied())
                            .with_triangle_indices(
                                asset.indices.chunks_exact(3).map(|t| [t[0], t[1], t[2]]),
                            )
                            .with_albedo_factor(color),
                    )?;
                }
                Geometry::Placeholder => {}
            }
        }
        Ok(())
    }

    /// Log pose axes
    pub fn log_axes(&self, topic: &str, layer: &AxesLayer) -> Result<(), Box<dyn std::error::Error>> {
        if !layer.has_pose() {
            return Ok(());
        }
        self.rec.log(
            entity_path(topic),
            &transform(&layer.world_pose()).with_axis_length(layer.axes_size as f32),
        )?;
        Ok(())
    }

    /// Log a path polyline
    pub fn log_path(&self, topic: &str, layer: &PathLayer) -> Result<(), Box<dyn std::error::Error>> {
        let points: Vec<[f32; 3]> = layer.world_points().iter().map(f32x3).collect();
        self.rec.log(
            entity_path(topic),
            &rerun::LineStrips3D::new([points]).with_colors([[0, 255, 0, 255]]),
        )?;
        Ok(())
    }

    /// Log the guide arc and landing marker
    pub fn log_guide(&self, preview: &GuidePreview) -> Result<(), Box<dyn std::error::Error>> {
        let points: Vec<[f32; 3]> = preview.points.iter().map(f32x3).collect();
        self.rec.log(
            "world/locomotion/guide",
            &rerun::LineStrips3D::new([points]).with_colors([[255, 255, 255, 200]]),
        )?;
        self.rec.log(
            "world/locomotion/landing",
            &rerun::Points3D::new([f32x3(&preview.landing_marker)])
                .with_colors([[0, 212, 255, 255]])
                .with_radii([0.25 * preview.marker_scale as f32]),
        )?;
        Ok(())
    }

    /// Log the viewer reference frame
    pub fn log_reference(&self, reference: &ReferenceFrame) -> Result<(), Box<dyn std::error::Error>> {
        let pose = Isometry3::from_parts(reference.position.into(), reference.rotation);
        self.rec.log(
            "world/viewer",
            &transform(&pose)
                .with_scale(reference.scale as f32)
                .with_axis_length(0.5),
        )?;
        self.rec.log("stats/viewer_scale", &rerun::Scalars::new([reference.scale]))?;
        Ok(())
    }

    /// Log the static ground grid
    pub fn log_ground_grid(&self, lines: &[[Vector3<f64>; 2]]) -> Result<(), Box<dyn std::error::Error>> {
        self.rec.log_static(
            "world/ground/grid",
            &rerun::LineStrips3D::new(lines.iter().map(|l| [f32x3(&l[0]), f32x3(&l[1])]))
                .with_colors([[60, 60, 60, 100]]),
        )?;
        Ok(())
    }
}
