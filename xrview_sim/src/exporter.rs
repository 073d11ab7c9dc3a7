//! JSON exporter for offline inspection.
//!
//! Exports sampled simulation frames (robot truth, rendered poses, scene
//! contents, viewer reference) as one JSON document per run.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Export I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Export serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A point in the export, flattened for plotting tools.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl PointSample {
    pub fn new(v: &Vector3<f64>) -> Self {
        Self {
            x: v.x,
            y: v.y,
            z: v.z,
        }
    }
}

/// Viewer reference frame at one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewerSample {
    pub position: PointSample,
    /// Radians about +Y
    pub yaw: f64,
    pub scale: f64,
}

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// Render tick number
    pub tick: u64,

    /// Where the robot base really is
    pub base_truth: PointSample,

    /// Where the scene renders it (absent until the frame is tracked)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_rendered: Option<PointSample>,

    /// Points across all visible cloud slots
    pub visible_points: usize,

    /// Marker entries, pending or ready
    pub markers: usize,

    pub viewer: ViewerSample,

    /// Events (halts, teleports, deletions, etc.)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SimEvent>,
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

impl SimEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: None,
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(time_sec: f64, events: Vec<SimEvent>) -> SimFrame {
        SimFrame {
            time_sec,
            tick: 1,
            base_truth: PointSample::new(&Vector3::new(1.0, 2.0, 3.0)),
            base_rendered: None,
            visible_points: 0,
            markers: 0,
            viewer: ViewerSample {
                position: PointSample::new(&Vector3::zeros()),
                yaw: 0.0,
                scale: 1.0,
            },
            events,
        }
    }

    #[test]
    fn test_duration_follows_last_frame() {
        let mut export = SimExport::new("smooth_follow", 42);
        export.add_frame(frame(0.5, vec![]));
        export.add_frame(frame(1.5, vec![]));
        export.finalize(true, None);
        assert_eq!(export.duration_sec, 1.5);
        assert!(export.passed);
    }

    #[test]
    fn test_empty_fields_skipped_in_json() {
        let json = serde_json::to_value(frame(0.0, vec![])).unwrap();
        assert!(json.get("events").is_none());
        assert!(json.get("base_rendered").is_none());
        assert_eq!(json["base_truth"]["y"], 2.0);

        let json = serde_json::to_value(frame(0.0, vec![SimEvent::info("halt")])).unwrap();
        assert_eq!(json["events"][0]["message"], "halt");
    }
}
