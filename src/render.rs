//! Display images derived from the terrain and a water depth snapshot.

use std::path::Path;

use image::{ImageBuffer, Rgb, RgbImage, Rgba, RgbaImage};
use log::info;

use crate::error::Result;
use crate::terrain::HeightField;
use crate::tilemap::Tilemap;

/// Lower bound on saturation/brightness when shading away from the mean.
const SHADE_FLOOR: f32 = 0.25;

/// Greyscale terrain, black at the lowest point and white at the highest.
/// A flat field renders black.
pub fn terrain_image(terrain: &HeightField) -> RgbImage {
    let (min_h, max_h) = terrain.range();
    let span = max_h - min_h;
    let map = terrain.tilemap();
    let mut img: RgbImage = ImageBuffer::new(map.width as u32, map.height as u32);

    for (x, y, &h) in map.iter() {
        let val = if span > 0.0 { (h - min_h) / span } else { 0.0 };
        let v = unit_to_u8(val);
        img.put_pixel(x as u32, y as u32, Rgb([v, v, v]));
    }
    img
}

/// Blue shading relative to the mean wet depth: shallower cells fade
/// towards white, deeper cells darken towards black.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DepthShading {
    mean: f32,
    min: u32,
    max: u32,
}

impl DepthShading {
    pub fn from_depths(depths: &Tilemap<u32>) -> Self {
        let mut min = u32::MAX;
        let mut max = 0;
        let mut count = 0u64;
        let mut total = 0u64;
        for &d in depths.as_slice().iter().filter(|&&d| d > 0) {
            min = min.min(d);
            max = max.max(d);
            count += 1;
            total += d as u64;
        }
        // Integer mean, so a single source reads as plain blue.
        let mean = if count > 0 { (total / count) as f32 } else { 0.0 };
        Self { mean, min, max }
    }

    /// Colour for a depth; `None` for dry cells.
    pub fn color(&self, depth: u32) -> Option<[u8; 3]> {
        if depth == 0 {
            return None;
        }
        let d = depth as f32;
        let (sat, bri) = if self.max == self.min {
            (1.0, 1.0)
        } else if self.mean > 0.0 && d < self.mean {
            (1.0 - (self.mean - d) / self.mean * (1.0 - SHADE_FLOOR), 1.0)
        } else if self.mean > 0.0 && d > self.mean {
            (1.0, 1.0 - (d - self.mean) / (self.max as f32 - self.mean) * (1.0 - SHADE_FLOOR))
        } else {
            (1.0, 1.0)
        };
        let rg = unit_to_u8(bri * (1.0 - sat));
        Some([rg, rg, unit_to_u8(bri)])
    }
}

/// Water layer with a transparent background.
pub fn water_image(depths: &Tilemap<u32>) -> RgbaImage {
    let shading = DepthShading::from_depths(depths);
    let mut img: RgbaImage = ImageBuffer::new(depths.width as u32, depths.height as u32);
    for (x, y, &d) in depths.iter() {
        let px = match shading.color(d) {
            Some([r, g, b]) => Rgba([r, g, b, 255]),
            None => Rgba([0, 0, 0, 0]),
        };
        img.put_pixel(x as u32, y as u32, px);
    }
    img
}

/// Water drawn over the terrain.
pub fn composite(terrain: &HeightField, depths: &Tilemap<u32>) -> RgbImage {
    let mut img = terrain_image(terrain);
    let water = water_image(depths);
    for (x, y, px) in water.enumerate_pixels() {
        if px[3] > 0 {
            img.put_pixel(x, y, Rgb([px[0], px[1], px[2]]));
        }
    }
    img
}

/// Scale an image up by an integer factor into a `0RGB` framebuffer.
pub fn to_buffer(img: &RgbImage, scale: usize) -> Vec<u32> {
    let scale = scale.max(1);
    let img_width = img.width() as usize;
    let out_width = img_width * scale;
    let out_height = img.height() as usize * scale;
    let mut buffer = vec![0u32; out_width * out_height];

    for (ix, iy, pixel) in img.enumerate_pixels() {
        let color = ((pixel[0] as u32) << 16) | ((pixel[1] as u32) << 8) | pixel[2] as u32;
        for sy in 0..scale {
            let row = (iy as usize * scale + sy) * out_width;
            for sx in 0..scale {
                buffer[row + ix as usize * scale + sx] = color;
            }
        }
    }
    buffer
}

/// Save the composited view as a PNG.
pub fn export_png(terrain: &HeightField, depths: &Tilemap<u32>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    composite(terrain, depths).save(path)?;
    info!("Exported {}x{} image to {}", depths.width, depths.height, path.display());
    Ok(())
}

fn unit_to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}
