use std::ops::RangeInclusive;

use rayon::prelude::*;

use crate::config::InputDynamicRange;

use super::frame::{Camera, LayeredFrame};
use super::psf::{PsfAxes, PsfTexture, TextureSample};
use super::tiling::{BufferLayout, Resolution};

const MIN_ALPHA: f32 = 1e-4;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Fragment {
    /// Premultiplied by `alpha`.
    pub color: [f32; 3],
    pub alpha: f32,
    /// Metres.
    pub depth: f32,
    /// Kernel radius in pixels.
    pub blur_radius: u32,
    /// Radius before rounding to a texture slice.
    pub blur_radius_cont: f32,
    /// Position between the two nearest defocus layers.
    pub lerp_factor: f32,
    /// PSF texture slice.
    pub psf_id: u32,
    /// Side of the pixel block this fragment stands for; 0 marks an empty slot.
    pub size: u32,
    pub layer: u32,
    pub incident_angle: [f32; 2],
}

impl Fragment {
    pub fn is_valid(&self) -> bool {
        self.size > 0
    }

    pub fn dioptres(&self) -> f32 {
        1.0 / self.depth.max(1e-6)
    }

    /// Luminance of the straight color.
    pub fn luminance(&self) -> f32 {
        let [r, g, b] = self.straight_color();
        0.2126 * r + 0.7152 * g + 0.0722 * b
    }

    pub fn straight_color(&self) -> [f32; 3] {
        if self.alpha <= MIN_ALPHA {
            return [0.0; 3];
        }
        self.color.map(|c| c / self.alpha)
    }
}

/// Maps a sample position and depth to its PSF texture slice.
pub struct FragmentClassifier<'a> {
    pub texture: &'a PsfTexture,
    pub axes: &'a PsfAxes,
    pub camera: Camera,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub sample: TextureSample,
    pub incident_angle: [f32; 2],
}

impl Classification {
    /// Fragment at this classification; `color` is premultiplied.
    pub fn fragment(&self, color: [f32; 3], alpha: f32, depth: f32, size: u32, layer: u32) -> Fragment {
        Fragment {
            color,
            alpha,
            depth,
            blur_radius: self.sample.blur_radius,
            blur_radius_cont: self.sample.blur_radius_cont,
            lerp_factor: self.sample.lerp_factor,
            psf_id: self.sample.psf_id,
            size,
            layer,
            incident_angle: self.incident_angle,
        }
    }
}

impl FragmentClassifier<'_> {
    /// `x`, `y` in pixels; merged fragments pass the centre of their block.
    pub fn classify(&self, x: f32, y: f32, depth: f32) -> Classification {
        let incident_angle = self.camera.incident_angle(self.resolution, x, y);
        let coords = [
            self.axes.defocus.fractional_index(1.0 / depth.max(1e-6)),
            self.axes.horizontal.fractional_index(incident_angle[0]),
            self.axes.vertical.fractional_index(incident_angle[1]),
        ];
        Classification {
            sample: self.texture.sample(coords),
            incident_angle,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FragmentBuffer {
    /// Padded grid the buffer covers.
    pub resolution: Resolution,
    pub layers: u32,
    pub fragments: Vec<Fragment>,
}

impl FragmentBuffer {
    pub fn new(layout: &BufferLayout) -> Self {
        Self {
            resolution: layout.padded_resolution,
            layers: layout.fragments_per_entry,
            fragments: vec![Fragment::default(); layout.fragment_count()],
        }
    }

    pub fn index(&self, x: u32, y: u32, layer: u32) -> usize {
        ((y * self.resolution.width + x) * self.layers + layer) as usize
    }

    /// Pixel and layer of a slot.
    pub fn position(&self, index: usize) -> (u32, u32, u32) {
        let index = index as u32;
        let layer = index % self.layers;
        let pixel = index / self.layers;
        (pixel % self.resolution.width, pixel / self.resolution.width, layer)
    }

    /// Pixels the kernels of a slot's block reach: the block grown by the
    /// fragment's blur radius on every side.
    pub fn footprint(&self, index: usize) -> (RangeInclusive<i32>, RangeInclusive<i32>) {
        let (x, y, _) = self.position(index);
        let f = &self.fragments[index];
        let (r, last) = (f.blur_radius as i32, f.size.max(1) as i32 - 1);
        let (x, y) = (x as i32, y as i32);
        (x - r..=x + last + r, y - r..=y + last + r)
    }

    pub fn valid_count(&self) -> usize {
        self.fragments.par_iter().filter(|f| f.is_valid()).count()
    }

    /// Fragment standing for pixel (x, y) on `layer`, looking through the
    /// merge block sizes from coarsest to finest.
    pub fn covering(&self, x: u32, y: u32, layer: u32, block_sizes: &[u32]) -> Option<&Fragment> {
        if x >= self.resolution.width || y >= self.resolution.height || layer >= self.layers {
            return None;
        }
        block_sizes
            .iter()
            .rev()
            .chain(std::iter::once(&1))
            .find_map(|&b| {
                let f = &self.fragments[self.index(x - x % b, y - y % b, layer)];
                (f.is_valid() && f.size == b).then_some(f)
            })
    }

    /// Fills the buffer from a frame; returns the number of fragments written.
    pub fn build(
        &mut self,
        frame: &LayeredFrame,
        classifier: &FragmentClassifier<'_>,
        depth_offset: f32,
        range: InputDynamicRange,
    ) -> usize {
        let width = self.resolution.width;
        let layers = self.layers;
        let source = frame.resolution;
        self.fragments
            .par_chunks_mut((width * layers) as usize)
            .enumerate()
            .map(|(y, row)| {
                let y = y as u32;
                let mut written = 0usize;
                for x in 0..width {
                    for layer in 0..layers {
                        let slot = &mut row[(x * layers + layer) as usize];
                        *slot = Fragment::default();
                        if x >= source.width || y >= source.height {
                            continue;
                        }
                        let Some(input) = frame.layers.get(layer as usize) else {
                            continue;
                        };
                        let i = (y * source.width + x) as usize;
                        let [mut r, mut g, mut b, a] = input.color[i];
                        let depth = input.depth[i] + depth_offset;
                        if a <= MIN_ALPHA || !depth.is_finite() || depth <= 0.0 {
                            continue;
                        }
                        if range == InputDynamicRange::Ldr {
                            [r, g, b] = [r, g, b].map(|c| c.clamp(0.0, 1.0));
                        }
                        let a = a.min(1.0);
                        let c = classifier.classify(x as f32, y as f32, depth);
                        *slot = c.fragment([r * a, g * a, b * a], a, depth, 1, layer);
                        written += 1;
                    }
                }
                written
            })
            .sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{BlurConfig, PsfAxisMethod};
    use crate::processing::frame::FrameLayer;
    use crate::processing::psf::stack::PsfAxis;
    use crate::processing::psf::{DerivedPsfTable, PackedWeights, PsfCacheSet, PsfStack, SliceParams, TextureOptions};

    /// On-axis texture of `stack` seen through `camera`.
    pub(crate) fn build_texture(stack: &PsfStack, camera: &Camera, resolution: Resolution) -> PsfTexture {
        let config = BlurConfig {
            max_resolution: resolution,
            ..Default::default()
        };
        let params = SliceParams::from_config_vectors(
            PsfAxisMethod::OnAxis,
            [0.0; 3],
            [0.0; 3],
            resolution,
            camera.fovy_limits_deg,
            config.max_coc,
        );
        let table =
            DerivedPsfTable::compute(stack, PsfAxisMethod::OnAxis, resolution, camera.fovy_limits_deg, config.max_coc)
                .unwrap();
        let packed = PackedWeights::pack(stack, &table);
        let caches = PsfCacheSet::build(stack, &params);
        let options = TextureOptions::from_config(&config, resolution);
        PsfTexture::build(stack, &caches, &table, &packed, camera, &options)
    }

    pub(crate) fn identity_texture(resolution: Resolution) -> (PsfAxes, PsfTexture) {
        let axes = PsfAxes {
            defocus: PsfAxis::new(0.0, 4.0, 3),
            horizontal: PsfAxis::single(0.0),
            vertical: PsfAxis::single(0.0),
            channels: 1,
            aperture: PsfAxis::single(4.0),
            focus: PsfAxis::single(0.5),
        };
        let texture = build_texture(&PsfStack::identity(axes), &Camera::default(), resolution);
        (axes, texture)
    }

    #[test]
    fn build_premultiplies_and_skips_empty_samples() {
        let res = Resolution::new(20, 10);
        let config = BlurConfig::default();
        let layout = BufferLayout::new(&config, res, 2).unwrap();
        let (axes, texture) = identity_texture(res);
        let classifier = FragmentClassifier {
            texture: &texture,
            axes: &axes,
            camera: Camera::default(),
            resolution: res,
        };
        let front = FrameLayer::filled(res, [0.8, 0.4, 0.2, 0.5], 1.0);
        let mut back = FrameLayer::filled(res, [0.0; 4], 3.0);
        back.color[0] = [1.0, 1.0, 1.0, 1.0];
        let frame = LayeredFrame::new(res, vec![front, back]).unwrap();

        let mut buffer = FragmentBuffer::new(&layout);
        assert_eq!(buffer.resolution, Resolution::new(32, 16));
        let written = buffer.build(&frame, &classifier, 0.0, InputDynamicRange::Ldr);
        assert_eq!(written, 20 * 10 + 1);
        assert_eq!(buffer.valid_count(), written);

        let f = buffer.fragments[buffer.index(3, 2, 0)];
        assert_eq!(f.color, [0.4, 0.2, 0.1]);
        assert_eq!(f.alpha, 0.5);
        assert_eq!(f.size, 1);
        assert!(buffer.fragments[buffer.index(25, 2, 0)].size == 0);
        assert_eq!(buffer.fragments[buffer.index(0, 0, 1)].layer, 1);
    }

    #[test]
    fn ldr_input_is_clamped_and_hdr_kept() {
        let res = Resolution::new(8, 8);
        let layout = BufferLayout::new(&BlurConfig::default(), res, 1).unwrap();
        let (axes, texture) = identity_texture(res);
        let classifier = FragmentClassifier {
            texture: &texture,
            axes: &axes,
            camera: Camera::default(),
            resolution: res,
        };
        let frame = LayeredFrame::new(res, vec![FrameLayer::filled(res, [4.0, -1.0, 0.5, 1.0], 2.0)]).unwrap();
        let mut buffer = FragmentBuffer::new(&layout);
        buffer.build(&frame, &classifier, 0.0, InputDynamicRange::Ldr);
        assert_eq!(buffer.fragments[buffer.index(1, 1, 0)].color, [1.0, 0.0, 0.5]);
        buffer.build(&frame, &classifier, 0.0, InputDynamicRange::Hdr);
        assert_eq!(buffer.fragments[buffer.index(1, 1, 0)].color, [4.0, -1.0, 0.5]);
    }

    #[test]
    fn footprint_spans_block_and_radius() {
        let layout = BufferLayout::new(&BlurConfig::default(), Resolution::new(32, 32), 1).unwrap();
        let mut buffer = FragmentBuffer::new(&layout);
        let i = buffer.index(8, 4, 0);
        buffer.fragments[i] = Fragment {
            blur_radius: 3,
            size: 4,
            alpha: 1.0,
            ..Default::default()
        };
        assert_eq!(buffer.footprint(i), (5..=14, 1..=10));
        buffer.fragments[i].size = 1;
        assert_eq!(buffer.footprint(i), (5..=11, 1..=7));
    }

    #[test]
    fn position_inverts_index() {
        let config = BlurConfig::default();
        let layout = BufferLayout::new(&config, Resolution::new(40, 20), 3).unwrap();
        let buffer = FragmentBuffer::new(&layout);
        let i = buffer.index(33, 17, 2);
        assert_eq!(buffer.position(i), (33, 17, 2));
    }

    #[test]
    fn depth_selects_defocus_slice() {
        let res = Resolution::new(16, 16);
        let (axes, texture) = identity_texture(res);
        let classifier = FragmentClassifier {
            texture: &texture,
            axes: &axes,
            camera: Camera::default(),
            resolution: res,
        };
        // defocus axis samples 0, 2 and 4 dioptres
        assert_eq!(classifier.classify(8.0, 8.0, 100.0).sample.psf_id, 0);
        assert_eq!(classifier.classify(8.0, 8.0, 0.5).sample.psf_id, 1);
        assert_eq!(classifier.classify(8.0, 8.0, 0.25).sample.psf_id, 2);
    }
}
