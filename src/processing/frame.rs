use image::{ImageBuffer, Luma, Rgba32FImage};
use serde::{Deserialize, Serialize};

use crate::error::{BlurError, BlurResult};

use super::tiling::Resolution;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Optical state of the viewer for one frame.
pub struct Camera {
    pub fovy_deg: f32,
    /// Field of view range the session may use; PSF storage is sized for it.
    pub fovy_limits_deg: [f32; 2],
    pub aperture_mm: f32,
    pub focus_distance_m: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            fovy_deg: 60.0,
            fovy_limits_deg: [30.0, 90.0],
            aperture_mm: 4.0,
            focus_distance_m: 2.0,
        }
    }
}

impl Camera {
    pub fn focus_dioptres(&self) -> f32 {
        1.0 / self.focus_distance_m.max(1e-3)
    }

    pub fn fovx_deg(&self, resolution: Resolution) -> f32 {
        let aspect = resolution.width as f32 / resolution.height.max(1) as f32;
        let half = (self.fovy_deg.to_radians() * 0.5).tan() * aspect;
        (2.0 * half.atan()).to_degrees()
    }

    /// Horizontal and vertical angle in degrees between the view axis and the
    /// ray through a pixel centre.
    pub fn incident_angle(&self, resolution: Resolution, x: f32, y: f32) -> [f32; 2] {
        let tan_y = (self.fovy_deg.to_radians() * 0.5).tan();
        let tan_x = (self.fovx_deg(resolution).to_radians() * 0.5).tan();
        let ndc_x = (x + 0.5) / resolution.width.max(1) as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y + 0.5) / resolution.height.max(1) as f32 * 2.0;
        [
            (ndc_x * tan_x).atan().to_degrees(),
            (ndc_y * tan_y).atan().to_degrees(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One compositing layer: straight-alpha color and linear depth in metres.
/// Samples with zero alpha or a non-positive depth are empty.
pub struct FrameLayer {
    pub color: Vec<[f32; 4]>,
    pub depth: Vec<f32>,
}

impl FrameLayer {
    pub fn filled(resolution: Resolution, color: [f32; 4], depth: f32) -> Self {
        let n = resolution.area() as usize;
        Self {
            color: vec![color; n],
            depth: vec![depth; n],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Color and depth of every layer of a frame, front-most layer first.
pub struct LayeredFrame {
    pub resolution: Resolution,
    pub layers: Vec<FrameLayer>,
}

impl LayeredFrame {
    pub fn new(resolution: Resolution, layers: Vec<FrameLayer>) -> BlurResult<Self> {
        let frame = Self { resolution, layers };
        frame.validate()?;
        Ok(frame)
    }

    pub fn validate(&self) -> BlurResult<()> {
        let expected = self.resolution.area() as usize;
        for (layer, l) in self.layers.iter().enumerate() {
            for len in [l.color.len(), l.depth.len()] {
                if len != expected {
                    return Err(BlurError::LayerSize {
                        layer,
                        len,
                        expected,
                    });
                }
            }
        }
        Ok(())
    }

    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Single-layer frame from a color image and a normalized depth image,
    /// where 0 maps to `near` and 1 to `far` metres.
    pub fn from_images(
        color: &Rgba32FImage,
        depth: &ImageBuffer<Luma<f32>, Vec<f32>>,
        near: f32,
        far: f32,
    ) -> BlurResult<Self> {
        let resolution = Resolution::new(color.width(), color.height());
        if depth.dimensions() != color.dimensions() {
            return Err(BlurError::LayerSize {
                layer: 0,
                len: depth.len(),
                expected: resolution.area() as usize,
            });
        }
        let layer = FrameLayer {
            color: color.pixels().map(|p| p.0).collect(),
            depth: depth
                .pixels()
                .map(|p| near + p.0[0].clamp(0.0, 1.0) * (far - near))
                .collect(),
        };
        Self::new(resolution, vec![layer])
    }

    /// Front layer color as an image, for passing frames through unblurred.
    pub fn to_image(&self) -> Rgba32FImage {
        let Resolution { width, height } = self.resolution;
        let front = self.layers.first();
        ImageBuffer::from_fn(width, height, |x, y| {
            let i = (y * width + x) as usize;
            image::Rgba(front.map(|l| l.color[i]).unwrap_or([0.0; 4]))
        })
    }
}
