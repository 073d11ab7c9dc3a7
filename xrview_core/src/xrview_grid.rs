//! The "GRID" Engine - Occupancy and cost grids to RGBA textures
//!
//! Each message is rasterized wholesale into a fresh `width × height × 4`
//! pixel buffer and mounted on a plane whose center sits half the grid's
//! physical extent away from the declared origin.

use std::f64::consts::PI;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;
use xrview_env::msgs::OccupancyGrid;

/// Value used by grids for cells that were never observed.
pub const UNKNOWN_CELL: i8 = -1;

/// Costmap sentinel colors: inscribed (99) is cyan, lethal (100) magenta.
pub const COSTMAP_INSCRIBED: [u8; 4] = [0, 255, 255, 255];
pub const COSTMAP_LETHAL: [u8; 4] = [255, 0, 255, 255];
pub const COSTMAP_UNKNOWN: [u8; 4] = [0x70, 0x89, 0x86, 255];

/// Largest grid accepted for rasterization (cells). A 8192 × 8192 map fits.
pub const MAX_GRID_CELLS: usize = 1 << 26;

const TRANSPARENT: [u8; 4] = [0, 0, 0, 0];
const UNKNOWN_ALPHA: u8 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    /// Grayscale occupancy with a translucent unknown color
    #[default]
    Map,
    /// Red-to-blue cost gradient with reserved sentinel colors
    Costmap,
}

/// Per-topic grid visualization options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridOptions {
    pub color_scheme: ColorScheme,
    pub show_unknown: bool,
    /// 0xRRGGBB used for unknown cells in map mode
    pub unknown_color: u32,
    pub opacity: f32,
    pub render_order: i32,
    /// Fixed z-bias; `None` picks one at random in [0, 0.01)
    pub z_offset: Option<f64>,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            color_scheme: ColorScheme::Map,
            show_unknown: true,
            unknown_color: 0xcc0000,
            opacity: 0.8,
            render_order: 0,
            z_offset: None,
        }
    }
}

/// Rasterized grid plus the plane it is mounted on.
#[derive(Debug, Clone, PartialEq)]
pub struct GridTexture {
    pub width: u32,
    pub height: u32,
    /// Meters per cell
    pub resolution: f32,
    /// RGBA, row-major, `width * height * 4` bytes
    pub pixels: Vec<u8>,
    /// Plane center and orientation in the grid's header frame
    pub placement: Isometry3<f64>,
    /// Plane extent in meters (x, y)
    pub extent: [f64; 2],
    pub frame_id: String,
    /// Textures are sampled nearest-neighbour
    pub nearest_filter: bool,
}

impl GridTexture {
    /// RGBA of a single cell.
    pub fn pixel(&self, col: u32, row: u32) -> Option<[u8; 4]> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let i = 4 * (row as usize * self.width as usize + col as usize);
        let p = self.pixels.get(i..i + 4)?;
        Some([p[0], p[1], p[2], p[3]])
    }
}

fn channel(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Color of one cell under the given options.
pub fn cell_color(value: i8, options: &GridOptions) -> [u8; 4] {
    match options.color_scheme {
        ColorScheme::Map => {
            if value != UNKNOWN_CELL {
                let gray = channel((1.0 - value as f64 / 100.0) * 220.0);
                [gray, gray, gray, 255]
            } else if options.show_unknown {
                let c = options.unknown_color;
                [(c >> 16) as u8, (c >> 8) as u8, c as u8, UNKNOWN_ALPHA]
            } else {
                TRANSPARENT
            }
        }
        ColorScheme::Costmap => match value {
            0 => TRANSPARENT,
            1..=98 => {
                let v = 255.0 * value as f64 / 100.0;
                [channel(v), 0, channel(255.0 - v), 255]
            }
            99 => COSTMAP_INSCRIBED,
            100 => COSTMAP_LETHAL,
            _ if options.show_unknown => COSTMAP_UNKNOWN,
            _ => TRANSPARENT,
        },
    }
}

/// Turns grids into textures, holding the per-instance z-bias.
#[derive(Debug, Clone)]
pub struct GridRasterizer {
    options: GridOptions,
    z_bias: f64,
}

impl GridRasterizer {
    pub fn new(options: GridOptions) -> Self {
        let z_bias = options
            .z_offset
            .unwrap_or_else(|| rand::random::<f64>() / 100.0);
        Self { options, z_bias }
    }

    pub fn options(&self) -> &GridOptions {
        &self.options
    }

    pub fn z_bias(&self) -> f64 {
        self.z_bias
    }

    /// Rasterizes a grid message into a freshly allocated texture.
    ///
    /// Missing trailing cells stay transparent; extra data is ignored.
    /// Grids whose declared size exceeds [`MAX_GRID_CELLS`] are logged and
    /// return `None`.
    pub fn rasterize(&self, grid: &OccupancyGrid) -> Option<GridTexture> {
        let info = &grid.info;
        let cells = (info.width as usize)
            .checked_mul(info.height as usize)
            .filter(|&cells| cells <= MAX_GRID_CELLS);
        let Some(bytes) = cells.and_then(|cells| cells.checked_mul(4)) else {
            warn!(
                frame = %grid.header.frame_id,
                width = info.width,
                height = info.height,
                actual = grid.data.len(),
                "Skipping oversized grid"
            );
            return None;
        };
        let cells = bytes / 4;
        let mut pixels = vec![0u8; bytes];

        if grid.data.len() < cells {
            warn!(
                frame = %grid.header.frame_id,
                expected = cells,
                actual = grid.data.len(),
                "Grid data shorter than declared size"
            );
        }

        for (i, value) in grid.data.iter().take(cells).enumerate() {
            pixels[4 * i..4 * i + 4].copy_from_slice(&cell_color(*value, &self.options));
        }

        let res = info.resolution as f64;
        let extent = [info.width as f64 * res, info.height as f64 * res];
        let origin = &info.origin.position;
        let placement = Isometry3::from_parts(
            Translation3::new(
                origin.x + extent[0] / 2.0,
                origin.y + extent[1] / 2.0,
                origin.z + self.z_bias,
            ),
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), PI),
        );

        Some(GridTexture {
            width: info.width,
            height: info.height,
            resolution: info.resolution,
            pixels,
            placement,
            extent,
            frame_id: grid.header.frame_id.clone(),
            nearest_filter: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use xrview_env::msgs::{Header, MapMetaData, Point, Pose};

    fn grid(width: u32, height: u32, data: Vec<i8>) -> OccupancyGrid {
        OccupancyGrid {
            header: Header::new("map"),
            info: MapMetaData {
                resolution: 0.5,
                width,
                height,
                origin: Pose {
                    position: Point::new(-1.0, 2.0, 0.0),
                    ..Default::default()
                },
            },
            data,
        }
    }

    fn costmap(show_unknown: bool) -> GridOptions {
        GridOptions {
            color_scheme: ColorScheme::Costmap,
            show_unknown,
            ..Default::default()
        }
    }

    #[test]
    fn test_map_gray_levels() {
        let opts = GridOptions::default();
        assert_eq!(cell_color(0, &opts), [220, 220, 220, 255]);
        assert_eq!(cell_color(100, &opts), [0, 0, 0, 255]);
        assert_eq!(cell_color(50, &opts), [110, 110, 110, 255]);
    }

    #[test]
    fn test_map_unknown_cells() {
        let mut opts = GridOptions::default();
        assert_eq!(cell_color(-1, &opts), [0xcc, 0, 0, 50]);
        opts.show_unknown = false;
        assert_eq!(cell_color(-1, &opts)[3], 0);
    }

    #[test]
    fn test_costmap_sentinels() {
        let opts = costmap(true);
        assert_eq!(cell_color(0, &opts)[3], 0);
        assert_eq!(cell_color(99, &opts), COSTMAP_INSCRIBED);
        assert_eq!(cell_color(100, &opts), COSTMAP_LETHAL);
        assert_eq!(COSTMAP_INSCRIBED, [0, 255, 255, 255]);
        assert_eq!(COSTMAP_LETHAL, [255, 0, 255, 255]);
        assert_eq!(cell_color(-1, &opts), COSTMAP_UNKNOWN);
        assert_eq!(cell_color(-1, &costmap(false))[3], 0);
    }

    #[test]
    fn test_costmap_gradient() {
        let opts = costmap(true);
        assert_eq!(cell_color(1, &opts), [3, 0, 252, 255]);
        assert_eq!(cell_color(50, &opts), [128, 0, 128, 255]);
        assert_eq!(cell_color(98, &opts), [250, 0, 5, 255]);
    }

    #[test]
    fn test_rasterize_dimensions_and_placement() {
        let raster = GridRasterizer::new(GridOptions {
            z_offset: Some(0.005),
            ..Default::default()
        });
        let tex = raster
            .rasterize(&grid(4, 2, vec![0, 100, -1, 50, 0, 0, 0, 0]))
            .unwrap();

        assert_eq!(tex.pixels.len(), 4 * 2 * 4);
        assert_eq!(tex.pixel(1, 0), Some([0, 0, 0, 255]));
        assert_eq!(tex.pixel(2, 0), Some([0xcc, 0, 0, 50]));
        assert_eq!(tex.pixel(4, 0), None);
        assert!(tex.nearest_filter);

        let center = tex.placement.translation.vector;
        assert_relative_eq!(center.x, -1.0 + 1.0);
        assert_relative_eq!(center.y, 2.0 + 0.5);
        assert_relative_eq!(center.z, 0.005);
        assert_relative_eq!(tex.placement.rotation.angle(), PI, epsilon = 1e-12);
    }

    #[test]
    fn test_short_data_leaves_tail_transparent() {
        let raster = GridRasterizer::new(GridOptions::default());
        let tex = raster.rasterize(&grid(2, 2, vec![0, 0])).unwrap();
        assert_eq!(tex.pixel(1, 0), Some([220, 220, 220, 255]));
        assert_eq!(tex.pixel(0, 1), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_oversized_grid_is_skipped() {
        let raster = GridRasterizer::new(GridOptions::default());
        assert!(raster.rasterize(&grid(u32::MAX, u32::MAX, vec![0; 4])).is_none());
        assert!(raster.rasterize(&grid(8192, 8193, vec![0; 4])).is_none());

        // Inflated but accepted sizes still rasterize with a transparent tail
        let tex = raster.rasterize(&grid(64, 64, vec![0; 4])).unwrap();
        assert_eq!(tex.pixels.len(), 64 * 64 * 4);
        assert_eq!(tex.pixel(5, 0), Some([0, 0, 0, 0]));
    }

    #[test]
    fn test_random_z_bias_is_small() {
        for _ in 0..32 {
            let bias = GridRasterizer::new(GridOptions::default()).z_bias();
            assert!((0.0..0.01).contains(&bias));
        }
    }
}
