use image::{Rgba, Rgba32FImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use rayon::prelude::*;

use crate::config::{
    AccumulationMethod, BlurConfig, OutputMode, OverlayMode, WeightRescaleMethod, WeightScaleMethod,
};

use super::defines::should_use_debug_kernels;
use super::fragment::{Fragment, FragmentBuffer};
use super::psf::PsfTexture;
use super::tile::TileBuffers;
use super::tiling::Resolution;

const MIN_COVERAGE: f32 = 1e-6;
const OVERLAY_COLOR: Rgba<f32> = Rgba([1.0, 0.0, 0.0, 1.0]);

/// Weight multiplier of a fragment standing for a `size`×`size` block.
pub fn weight_scale(method: WeightScaleMethod, size: u32) -> f32 {
    let s = size as f32;
    match method {
        WeightScaleMethod::One => 1.0,
        WeightScaleMethod::Linear => s,
        WeightScaleMethod::AreaSquare => s * s,
        WeightScaleMethod::AreaCircle => (std::f32::consts::FRAC_PI_4 * s * s).max(1.0),
    }
}

#[derive(Debug, Clone)]
pub struct ConvolutionParams {
    pub accumulation: AccumulationMethod,
    pub alpha_threshold: f32,
    pub normalize: bool,
    pub weight_scale: WeightScaleMethod,
    pub weight_rescale: WeightRescaleMethod,
    /// Debug outputs and overlays only run in the debug kernels.
    pub debug: bool,
    pub output_mode: OutputMode,
    pub overlay_mode: OverlayMode,
    /// Block sizes of the merge passes that ran, finest first.
    pub block_sizes: Vec<u32>,
    pub max_coc: u32,
    pub group_size: u32,
}

impl ConvolutionParams {
    pub fn from_config(config: &BlurConfig) -> Self {
        Self {
            accumulation: config.accumulation,
            alpha_threshold: config.alpha_threshold,
            normalize: config.normalize_result,
            weight_scale: config.weight_scale,
            weight_rescale: config.weight_rescale,
            debug: should_use_debug_kernels(config),
            output_mode: config.output_mode,
            overlay_mode: config.overlay_mode,
            block_sizes: config.active_merge_presets().iter().map(|p| p.block_size).collect(),
            max_coc: config.max_coc,
            group_size: config.group_sizes.convolution,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
/// Premultiplied color, alpha and summed weight gathered for one pixel.
pub struct Accumulated {
    pub color: [f32; 3],
    pub alpha: f32,
    pub weight: f32,
}

impl Accumulated {
    /// Straight-alpha output color.
    pub fn resolve(&self, method: AccumulationMethod, normalize: bool) -> [f32; 4] {
        let [r, g, b] = self.color;
        if !normalize {
            return [r, g, b, self.alpha.min(1.0)];
        }
        if self.alpha <= MIN_COVERAGE {
            return [0.0; 4];
        }
        let alpha = match method {
            AccumulationMethod::Sum => self.alpha / self.weight.max(MIN_COVERAGE),
            _ => self.alpha,
        };
        [r / self.alpha, g / self.alpha, b / self.alpha, alpha.min(1.0)]
    }
}

struct Gather<'a> {
    fragments: &'a FragmentBuffer,
    tiles: &'a TileBuffers,
    texture: &'a PsfTexture,
    params: &'a ConvolutionParams,
}

impl Gather<'_> {
    /// Per-channel weight slot `index` lands at pixel (x, y): the kernel
    /// summed over every pixel of the fragment's block, averaged over the
    /// block and scaled by the weight scale method.
    fn weights(&self, index: usize, f: &Fragment, x: i32, y: i32) -> Option<[f32; 3]> {
        let (xs, ys) = self.fragments.footprint(index);
        if !xs.contains(&x) || !ys.contains(&y) {
            return None;
        }
        let (ax, ay, _) = self.fragments.position(index);
        let (ax, ay) = (ax as i32, ay as i32);
        let last = f.size.max(1) as i32 - 1;
        let scale = weight_scale(self.params.weight_scale, f.size) / (f.size * f.size).max(1) as f32;
        let (u, v) = (x - ax - last..=x - ax, y - ay - last..=y - ay);
        Some(std::array::from_fn(|ch| {
            self.texture.area(f.psf_id, ch).sum(u.clone(), v.clone()) * scale
        }))
    }

    fn accumulate(&self, x: u32, y: u32) -> Accumulated {
        let tile = self.tiles.tile_of_pixel(x, y);
        let count = self.tiles.count(tile);
        let method = self.params.accumulation;
        let mut acc = Accumulated::default();
        for i in 0..count {
            let i = match method {
                AccumulationMethod::BackToFront => count - 1 - i,
                _ => i,
            };
            if method == AccumulationMethod::FrontToBack && acc.alpha >= self.params.alpha_threshold {
                break;
            }
            let index = self.tiles.entry(tile, i).fragment as usize;
            let f = &self.fragments.fragments[index];
            let Some(w) = self.weights(index, f, x as i32, y as i32) else {
                continue;
            };
            let w_alpha = (w[0] + w[1] + w[2]) / 3.0;
            let (coverage, keep) = match self.params.weight_rescale {
                WeightRescaleMethod::AlphaBlend if w_alpha * f.alpha > 1.0 => (1.0, 1.0 / (w_alpha * f.alpha)),
                _ => (w_alpha * f.alpha, 1.0),
            };
            match method {
                AccumulationMethod::Sum => {
                    for ch in 0..3 {
                        acc.color[ch] += w[ch] * f.color[ch];
                    }
                    acc.alpha += w_alpha * f.alpha;
                }
                AccumulationMethod::FrontToBack => {
                    let transmit = (1.0 - acc.alpha).max(0.0);
                    for ch in 0..3 {
                        acc.color[ch] += transmit * keep * w[ch] * f.color[ch];
                    }
                    acc.alpha += transmit * coverage;
                }
                AccumulationMethod::BackToFront => {
                    let transmit = (1.0 - coverage).max(0.0);
                    for ch in 0..3 {
                        acc.color[ch] = keep * w[ch] * f.color[ch] + transmit * acc.color[ch];
                    }
                    acc.alpha = coverage + transmit * acc.alpha;
                }
            }
            acc.weight += w_alpha;
        }
        acc
    }

    fn covering(&self, x: u32, y: u32) -> Option<&Fragment> {
        self.fragments.covering(x, y, 0, &self.params.block_sizes)
    }

    fn pixel(&self, x: u32, y: u32) -> [f32; 4] {
        let p = self.params;
        if !p.debug || p.output_mode == OutputMode::Convolution {
            return self.accumulate(x, y).resolve(p.accumulation, p.normalize);
        }
        let gray = |v: f32| [v, v, v, 1.0];
        let covering = self.covering(x, y);
        match p.output_mode {
            OutputMode::Alpha => gray(self.accumulate(x, y).alpha.min(1.0)),
            OutputMode::TileBufferSize => {
                let tile = self.tiles.tile_of_pixel(x, y);
                gray(self.tiles.count(tile) as f32 / self.tiles.capacity.max(1) as f32)
            }
            _ => {
                let Some(f) = covering else {
                    return [0.0; 4];
                };
                match p.output_mode {
                    OutputMode::MergedColor => {
                        let [r, g, b] = f.straight_color();
                        [r, g, b, 1.0]
                    }
                    OutputMode::MergedDepth => gray(f.depth),
                    OutputMode::FragmentSize => {
                        let largest = p.block_sizes.last().copied().unwrap_or(1);
                        gray(f.size as f32 / largest as f32)
                    }
                    OutputMode::PsfId => gray(f.psf_id as f32 / self.texture.slice_count().max(1) as f32),
                    OutputMode::LerpFactor => gray(f.lerp_factor),
                    OutputMode::BlurRadius => gray(f.blur_radius as f32 / p.max_coc.max(1) as f32),
                    OutputMode::BlurRadiusFract => gray(f.blur_radius_cont.fract()),
                    OutputMode::BlurRadiusCont => gray(f.blur_radius_cont / p.max_coc.max(1) as f32),
                    OutputMode::IncidentAngle => {
                        let [h, v] = f.incident_angle;
                        [h / 180.0 + 0.5, v / 180.0 + 0.5, 0.0, 1.0]
                    }
                    _ => [0.0; 4],
                }
            }
        }
    }

    /// Value compared between neighboring pixels for border overlays.
    fn border_key(&self, x: u32, y: u32) -> Option<u32> {
        let f = self.covering(x, y)?;
        match self.params.overlay_mode {
            OverlayMode::PsfBorder => Some(f.psf_id),
            OverlayMode::BlurRadiusBorder => Some(f.blur_radius),
            OverlayMode::ObjectDepthBorder => Some(self.texture.defocus_layer(f.psf_id) as u32),
            OverlayMode::None | OverlayMode::TileBorder => None,
        }
    }

    fn draw_overlay(&self, image: &mut Rgba32FImage) {
        let (width, height) = image.dimensions();
        match self.params.overlay_mode {
            OverlayMode::None => {}
            OverlayMode::TileBorder => {
                let t = self.tiles.tile_size;
                for ty in 0..height.div_ceil(t) {
                    for tx in 0..width.div_ceil(t) {
                        let rect = Rect::at((tx * t) as i32, (ty * t) as i32).of_size(t, t);
                        draw_hollow_rect_mut(image, rect, OVERLAY_COLOR);
                    }
                }
            }
            _ => {
                let border: Vec<(u32, u32)> = (0..height)
                    .into_par_iter()
                    .flat_map_iter(|y| {
                        (0..width).filter_map(move |x| {
                            let key = self.border_key(x, y);
                            let right = (x + 1 < width).then(|| self.border_key(x + 1, y));
                            let below = (y + 1 < height).then(|| self.border_key(x, y + 1));
                            [right, below]
                                .into_iter()
                                .flatten()
                                .any(|k| k != key)
                                .then_some((x, y))
                        })
                    })
                    .collect();
                for (x, y) in border {
                    image.put_pixel(x, y, OVERLAY_COLOR);
                }
            }
        }
    }
}

/// Renders the output image for `resolution` from the built tile lists.
pub fn convolve(
    fragments: &FragmentBuffer,
    tiles: &TileBuffers,
    texture: &PsfTexture,
    resolution: Resolution,
    params: &ConvolutionParams,
) -> Rgba32FImage {
    let gather = Gather {
        fragments,
        tiles,
        texture,
        params,
    };
    let Resolution { width, height } = resolution;
    let mut image = Rgba32FImage::new(width, height);
    if width == 0 || height == 0 {
        return image;
    }
    image
        .par_chunks_mut(width as usize * 4)
        .with_min_len(params.group_size.max(1) as usize)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                px.copy_from_slice(&gather.pixel(x as u32, y as u32));
            }
        });
    if params.debug {
        gather.draw_overlay(&mut image);
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelType;
    use crate::processing::fragment::tests::{build_texture, identity_texture};
    use crate::processing::frame::Camera;
    use crate::processing::psf::stack::{PsfAxes, PsfAxis, PsfStack, SummedArea};
    use crate::processing::sort::SortBuffers;
    use crate::processing::tiling::BufferLayout;

    fn params(accumulation: AccumulationMethod, normalize: bool) -> ConvolutionParams {
        ConvolutionParams {
            accumulation,
            normalize,
            ..ConvolutionParams::from_config(&BlurConfig::default())
        }
    }

    /// Two fragments stacked on pixel (3, 3), front at 1 m and back at 3 m.
    fn stacked(front: [f32; 4], back: [f32; 4]) -> (BufferLayout, FragmentBuffer, TileBuffers) {
        let config = BlurConfig::default();
        let layout = BufferLayout::new(&config, Resolution::new(16, 16), 2).unwrap();
        let mut fragments = FragmentBuffer::new(&layout);
        for (layer, ([r, g, b, a], depth)) in [(front, 1.0), (back, 3.0)].into_iter().enumerate() {
            let index = fragments.index(3, 3, layer as u32);
            fragments.fragments[index] = Fragment {
                color: [r * a, g * a, b * a],
                alpha: a,
                depth,
                size: 1,
                layer: layer as u32,
                ..Default::default()
            };
        }
        let mut tiles = TileBuffers::new(&layout);
        tiles.build_centers(&fragments);
        tiles.write_splat_commands(32);
        tiles.splat(&fragments, 32);
        (layout, fragments, tiles)
    }

    fn approx(a: [f32; 4], b: [f32; 4]) {
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn weight_scale_grows_with_block_size() {
        assert_eq!(weight_scale(WeightScaleMethod::One, 4), 1.0);
        assert_eq!(weight_scale(WeightScaleMethod::Linear, 4), 4.0);
        assert_eq!(weight_scale(WeightScaleMethod::AreaSquare, 4), 16.0);
        assert_eq!(weight_scale(WeightScaleMethod::AreaCircle, 1), 1.0);
        assert!((weight_scale(WeightScaleMethod::AreaCircle, 4) - 12.566_371).abs() < 1e-4);
    }

    #[test]
    fn back_to_front_matches_over_operator() {
        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let front = [1.0, 0.0, 0.0, 0.5];
        let back = [0.0, 0.0, 1.0, 0.8];
        let (layout, fragments, tiles) = stacked(front, back);
        let mut sort = SortBuffers::new(&layout, 256);
        sort.write_params(&tiles);
        sort.sort_tiles(&tiles, &fragments, 0.01, 0.0);

        let out = convolve(&fragments, &tiles, &texture, res, &params(AccumulationMethod::BackToFront, false));
        // premultiplied: front + (1 - 0.5) * back
        approx(out.get_pixel(3, 3).0, [0.5, 0.0, 0.4, 0.9]);
        assert_eq!(out.get_pixel(4, 3).0, [0.0; 4]);

        let out = convolve(&fragments, &tiles, &texture, res, &params(AccumulationMethod::BackToFront, true));
        approx(out.get_pixel(3, 3).0, [0.5 / 0.9, 0.0, 0.4 / 0.9, 0.9]);
    }

    #[test]
    fn front_to_back_stops_at_threshold() {
        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let (layout, fragments, tiles) = stacked([0.0, 1.0, 0.0, 0.6], [1.0, 1.0, 1.0, 1.0]);
        let mut sort = SortBuffers::new(&layout, 256);
        sort.write_params(&tiles);
        sort.sort_tiles(&tiles, &fragments, 0.01, 0.0);

        let mut p = params(AccumulationMethod::FrontToBack, false);
        approx(
            convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0,
            [0.4, 1.0, 0.4, 1.0],
        );
        p.alpha_threshold = 0.5;
        approx(
            convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0,
            [0.0, 0.6, 0.0, 0.6],
        );
    }

    #[test]
    fn sum_averages_by_coverage() {
        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let (_, fragments, tiles) = stacked([1.0, 0.0, 0.0, 1.0], [0.0, 1.0, 0.0, 1.0]);
        let out = convolve(&fragments, &tiles, &texture, res, &params(AccumulationMethod::Sum, true));
        approx(out.get_pixel(3, 3).0, [0.5, 0.5, 0.0, 1.0]);
        let raw = convolve(&fragments, &tiles, &texture, res, &params(AccumulationMethod::Sum, false));
        approx(raw.get_pixel(3, 3).0, [1.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn debug_modes_replace_the_final_write() {
        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let (_, fragments, tiles) = stacked([0.2, 0.4, 0.6, 0.5], [1.0; 4]);
        let mut p = params(AccumulationMethod::FrontToBack, true);
        p.debug = true;
        p.output_mode = OutputMode::MergedColor;
        approx(
            convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0,
            [0.2, 0.4, 0.6, 1.0],
        );
        p.output_mode = OutputMode::MergedDepth;
        assert_eq!(convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0[0], 1.0);
        p.output_mode = OutputMode::TileBufferSize;
        let out = convolve(&fragments, &tiles, &texture, res, &p);
        assert!(out.get_pixel(3, 3).0[0] > 0.0);
        assert_eq!(out.get_pixel(3, 3).0, out.get_pixel(0, 0).0);
    }

    #[test]
    fn tile_border_overlay_outlines_tiles() {
        let res = Resolution::new(32, 16);
        let (_, texture) = identity_texture(res);
        let config = BlurConfig::default();
        let layout = BufferLayout::new(&config, res, 1).unwrap();
        let fragments = FragmentBuffer::new(&layout);
        let tiles = TileBuffers::new(&layout);
        let mut p = params(AccumulationMethod::FrontToBack, true);
        p.debug = true;
        p.overlay_mode = OverlayMode::TileBorder;
        let out = convolve(&fragments, &tiles, &texture, res, &p);
        assert_eq!(*out.get_pixel(16, 5), OVERLAY_COLOR);
        assert_eq!(*out.get_pixel(15, 5), OVERLAY_COLOR);
        assert_eq!(out.get_pixel(8, 8).0, [0.0; 4]);
    }

    #[test]
    fn merged_block_spreads_like_its_pixels() {
        let res = Resolution::new(64, 64);
        let axes = PsfAxes {
            defocus: PsfAxis::new(0.0, 4.0, 3),
            horizontal: PsfAxis::single(0.0),
            vertical: PsfAxis::single(0.0),
            channels: 1,
            aperture: PsfAxis::single(8.0),
            focus: PsfAxis::single(0.0),
        };
        let camera = Camera {
            fovy_deg: 10.0,
            fovy_limits_deg: [10.0, 30.0],
            ..Default::default()
        };
        let texture = build_texture(&PsfStack::thin_lens(axes, 9), &camera, res);
        let slice = texture.sample([2.0, 0.0, 0.0]).psf_id;
        let r = texture.radius(slice);
        assert!((5..20).contains(&r), "radius {r}");

        let config = BlurConfig::default();
        let layout = BufferLayout::new(&config, res, 1).unwrap();
        let fragment = |size| Fragment {
            color: [0.5, 0.25, 1.0],
            alpha: 1.0,
            depth: 0.25,
            blur_radius: r,
            psf_id: slice,
            size,
            ..Default::default()
        };
        let mut merged = FragmentBuffer::new(&layout);
        let anchor = merged.index(28, 28, 0);
        merged.fragments[anchor] = fragment(4);
        let mut pixels = FragmentBuffer::new(&layout);
        for y in 28..32 {
            for x in 28..32 {
                let i = pixels.index(x, y, 0);
                pixels.fragments[i] = fragment(1);
            }
        }
        let p = params(AccumulationMethod::Sum, false);
        let render = |fragments: &FragmentBuffer| {
            let mut tiles = TileBuffers::new(&layout);
            tiles.build_centers(fragments);
            tiles.write_splat_commands(32);
            tiles.splat(fragments, 32);
            convolve(fragments, &tiles, &texture, res, &p)
        };
        let (a, b) = (render(&merged), render(&pixels));
        for (pa, pb) in a.pixels().zip(b.pixels()) {
            for ch in 0..4 {
                assert!((pa.0[ch] - pb.0[ch]).abs() < 1e-4, "{pa:?} != {pb:?}");
            }
        }
        // one pixel left of where a kernel centred on the block would end
        assert!(a.get_pixel(29 - r, 30).0[0] > 0.0);
    }

    #[test]
    fn alpha_blend_keeps_color_within_coverage() {
        let res = Resolution::new(16, 16);
        let (_, mut texture) = identity_texture(res);
        for kernel in texture.kernels.iter_mut() {
            kernel.weights = vec![2.0];
        }
        texture.areas = texture.kernels.iter().map(SummedArea::new).collect();
        let (layout, fragments, tiles) = stacked([1.0, 0.0, 0.0, 0.75], [0.0, 0.0, 1.0, 1.0]);
        let mut sort = SortBuffers::new(&layout, 256);
        sort.write_params(&tiles);
        sort.sort_tiles(&tiles, &fragments, 0.01, 0.0);

        let mut p = params(AccumulationMethod::FrontToBack, false);
        assert_eq!(p.weight_rescale, WeightRescaleMethod::AlphaBlend);
        approx(
            convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0,
            [1.0, 0.0, 0.0, 1.0],
        );
        p.weight_rescale = WeightRescaleMethod::LinearRescale;
        approx(
            convolve(&fragments, &tiles, &texture, res, &p).get_pixel(3, 3).0,
            [1.5, 0.0, 0.0, 1.0],
        );
    }

    #[test]
    fn release_kernels_ignore_debug_output() {
        let mut config = BlurConfig {
            output_mode: OutputMode::MergedDepth,
            overlay_mode: OverlayMode::TileBorder,
            ..Default::default()
        };
        assert!(ConvolutionParams::from_config(&config).debug);
        config.kernel_type = KernelType::Release;
        let p = ConvolutionParams::from_config(&config);
        assert!(!p.debug);

        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let (_, fragments, tiles) = stacked([0.2, 0.4, 0.6, 1.0], [1.0; 4]);
        let out = convolve(&fragments, &tiles, &texture, res, &p);
        approx(out.get_pixel(3, 3).0, [0.2, 0.4, 0.6, 1.0]);
        assert_eq!(out.get_pixel(0, 5).0, [0.0; 4]);
    }

    #[test]
    fn radius_debug_modes_show_continuous_values() {
        let res = Resolution::new(16, 16);
        let (_, texture) = identity_texture(res);
        let (_, mut fragments, tiles) = stacked([1.0; 4], [1.0; 4]);
        let front = fragments.index(3, 3, 0);
        fragments.fragments[front].lerp_factor = 0.25;
        fragments.fragments[front].blur_radius_cont = 2.5;
        let mut p = params(AccumulationMethod::FrontToBack, true);
        p.debug = true;
        for (mode, expected) in [
            (OutputMode::LerpFactor, 0.25),
            (OutputMode::BlurRadiusFract, 0.5),
            (OutputMode::BlurRadiusCont, 2.5 / 32.0),
        ] {
            p.output_mode = mode;
            let out = convolve(&fragments, &tiles, &texture, res, &p);
            approx(out.get_pixel(3, 3).0, [expected, expected, expected, 1.0]);
        }
    }
}
