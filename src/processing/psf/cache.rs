use half::f16;
use rayon::prelude::*;
use tracing::debug;

use crate::config::{BlurConfig, PsfAxisMethod, PsfTextureAngleLayout, PsfTextureDepthLayout, PsfTextureFormat};
use crate::processing::frame::Camera;
use crate::processing::tiling::Resolution;

use super::params::{DerivedPsfTable, PackedWeights, blur_radius_pixels, reduced_layers};
use super::stack::{
    AXIS_APERTURE, AXIS_CHANNEL, AXIS_DEFOCUS, AXIS_FOCUS, AXIS_HORIZONTAL, AXIS_VERTICAL, Kernel,
    NUM_AXES, PsfIndex, PsfStack, SummedArea,
};

/// Stack axes spanned by the texture, in texture order.
pub const TEXTURE_AXES: [usize; 3] = [AXIS_DEFOCUS, AXIS_HORIZONTAL, AXIS_VERTICAL];

#[derive(Debug, Clone, PartialEq, Eq)]
/// Layer placement along one texture axis.
pub struct SliceLayout {
    /// First stack index covered.
    pub base: usize,
    /// Layers per gap between consecutive stack indices; empty when the axis
    /// is pinned to a single index.
    pub segments: Vec<usize>,
}

impl SliceLayout {
    pub fn fixed(index: usize) -> Self {
        Self {
            base: index,
            segments: Vec::new(),
        }
    }

    /// One layer per stack index.
    pub fn exact(count: usize) -> Self {
        Self {
            base: 0,
            segments: vec![1; count.saturating_sub(1)],
        }
    }

    pub fn num_layers(&self) -> usize {
        1 + self.segments.iter().sum::<usize>()
    }

    /// Fractional layer of a fractional stack index.
    pub fn position_of(&self, coordinate: f32) -> f32 {
        if self.segments.is_empty() {
            return 0.0;
        }
        let local = (coordinate - self.base as f32).clamp(0.0, self.segments.len() as f32);
        let segment = (local.floor() as usize).min(self.segments.len() - 1);
        let t = local - segment as f32;
        let start: usize = self.segments[..segment].iter().sum();
        start as f32 + t * self.segments[segment] as f32
    }

    /// Nearest layer to a fractional stack index.
    pub fn layer_of(&self, coordinate: f32) -> usize {
        self.position_of(coordinate).round() as usize
    }

    /// Fractional stack index of a layer.
    pub fn coordinate_of(&self, layer: usize) -> f32 {
        let mut start = 0;
        for (segment, &n) in self.segments.iter().enumerate() {
            if layer < start + n {
                return self.base as f32 + segment as f32 + (layer - start) as f32 / n as f32;
            }
            start += n;
        }
        (self.base + self.segments.len()) as f32
    }
}

/// Layouts of the three texture axes.
pub type TextureLayout = [SliceLayout; 3];

pub fn layout_layers(layout: &TextureLayout) -> [usize; 3] {
    [
        layout[0].num_layers(),
        layout[1].num_layers(),
        layout[2].num_layers(),
    ]
}

/// Parameters shared by every slice computation of one session.
#[derive(Debug, Clone, Copy)]
pub struct SliceParams {
    pub method: PsfAxisMethod,
    /// Reduction strength per texture axis.
    pub s: [f32; 3],
    pub p: [f32; 3],
    pub resolution: Resolution,
    pub fovy_limits: [f32; 2],
    pub max_coc: u32,
}

impl SliceParams {
    /// Config vectors are ordered (horizontal, vertical, defocus).
    pub fn from_config_vectors(
        method: PsfAxisMethod,
        s: [f32; 3],
        p: [f32; 3],
        resolution: Resolution,
        fovy_limits: [f32; 2],
        max_coc: u32,
    ) -> Self {
        Self {
            method,
            s: [s[2], s[0], s[1]],
            p: [p[2], p[0], p[1]],
            resolution,
            fovy_limits,
            max_coc,
        }
    }
}

/// Largest pixel-radius change between two stack entries over the fovy range.
fn radius_difference(stack: &PsfStack, a: &PsfIndex, b: &PsfIndex, params: &SliceParams) -> (f32, f32) {
    let deg_a = stack.get(a).blur_radius_deg;
    let deg_b = stack.get(b).blur_radius_deg;
    let cap = params.max_coc as f32;
    let mut diff = 0.0f32;
    let mut max_radius = 0.0f32;
    for fovy in params.fovy_limits {
        let ra = blur_radius_pixels(deg_a, params.resolution.height, fovy).min(cap);
        let rb = blur_radius_pixels(deg_b, params.resolution.height, fovy).min(cap);
        diff = diff.max((ra - rb).abs());
        max_radius = max_radius.max(ra.max(rb));
    }
    (diff, max_radius)
}

/// Layer layout per texture axis for the given aperture and focus index
/// ranges. Each gap takes the most layers any combination of the other
/// indices needs; ties go to the combination with the larger radius.
pub fn slices_per_axis(
    stack: &PsfStack,
    params: &SliceParams,
    apertures: std::ops::RangeInclusive<usize>,
    focuses: std::ops::RangeInclusive<usize>,
) -> TextureLayout {
    let shape = stack.shape();
    if params.method == PsfAxisMethod::OnAxis {
        return [
            SliceLayout::exact(shape[AXIS_DEFOCUS]),
            SliceLayout::fixed(stack.axes.horizontal.center()),
            SliceLayout::fixed(stack.axes.vertical.center()),
        ];
    }

    let mut layouts: TextureLayout = [
        SliceLayout::exact(1),
        SliceLayout::exact(1),
        SliceLayout::exact(1),
    ];
    for (texture_axis, &axis) in TEXTURE_AXES.iter().enumerate() {
        let count = shape[axis];
        let (s, p) = (params.s[texture_axis], params.p[texture_axis]);
        let segments = (0..count.saturating_sub(1))
            .into_par_iter()
            .map(|segment| {
                let mut best = (1usize, 0.0f32);
                for index in stack.indices() {
                    if index.0[axis] != segment
                        || !apertures.contains(&index.0[AXIS_APERTURE])
                        || !focuses.contains(&index.0[AXIS_FOCUS])
                    {
                        continue;
                    }
                    let mut next = index;
                    next.0[axis] = segment + 1;
                    let (diff, max_radius) = radius_difference(stack, &index, &next, params);
                    let layers = reduced_layers(diff, s, p);
                    if layers > best.0 || (layers == best.0 && max_radius > best.1) {
                        best = (layers, max_radius);
                    }
                }
                best.0
            })
            .collect();
        layouts[texture_axis] = SliceLayout {
            base: 0,
            segments,
        };
    }
    layouts
}

#[derive(Debug, Clone, PartialEq)]
/// Stack entries blended into one cache layer.
pub struct Recipe {
    pub corners: Vec<(u32, f32)>,
    pub blur_radius_deg: f32,
}

fn axis_corners(coordinate: f32, count: usize) -> [(usize, f32); 2] {
    let lo = (coordinate.floor().max(0.0) as usize).min(count - 1);
    let hi = (lo + 1).min(count - 1);
    let t = if hi == lo { 0.0 } else { coordinate - lo as f32 };
    [(lo, 1.0 - t), (hi, t)]
}

fn trilinear_recipe(stack: &PsfStack, coords: [f32; 3], fixed: PsfIndex) -> Recipe {
    let shape = stack.shape();
    let per_axis: Vec<[(usize, f32); 2]> = TEXTURE_AXES
        .iter()
        .zip(coords)
        .map(|(&axis, c)| axis_corners(c, shape[axis]))
        .collect();
    let mut corners: Vec<(u32, f32)> = Vec::with_capacity(8);
    let mut blur_radius_deg = 0.0;
    for &(d, wd) in &per_axis[0] {
        for &(h, wh) in &per_axis[1] {
            for &(v, wv) in &per_axis[2] {
                let w = wd * wh * wv;
                if w <= 0.0 {
                    continue;
                }
                let mut index = fixed;
                index.0[AXIS_DEFOCUS] = d;
                index.0[AXIS_HORIZONTAL] = h;
                index.0[AXIS_VERTICAL] = v;
                let flat = stack.flat_index(&index) as u32;
                blur_radius_deg += w * stack.entries[flat as usize].blur_radius_deg;
                match corners.iter_mut().find(|(id, _)| *id == flat) {
                    Some((_, acc)) => *acc += w,
                    None => corners.push((flat, w)),
                }
            }
        }
    }
    Recipe {
        corners,
        blur_radius_deg,
    }
}

#[derive(Debug, Clone)]
/// Interpolation recipes for one (aperture, focus) pair, one per layer of
/// the shared texture layout.
pub struct PsfCache {
    pub aperture: usize,
    pub focus: usize,
    pub layers: [usize; 3],
    pub channels: usize,
    /// Indexed `layer_index * channels + channel`.
    pub recipes: Vec<Recipe>,
}

impl PsfCache {
    pub fn build(stack: &PsfStack, layout: &TextureLayout, aperture: usize, focus: usize) -> Self {
        let channels = stack.axes.channels.max(1);
        let layers = layout_layers(layout);
        let [nd, nh, nv] = layers;
        let mut recipes = Vec::with_capacity(nd * nh * nv * channels);
        for ld in 0..nd {
            for lh in 0..nh {
                for lv in 0..nv {
                    let coords = [
                        layout[0].coordinate_of(ld),
                        layout[1].coordinate_of(lh),
                        layout[2].coordinate_of(lv),
                    ];
                    for channel in 0..channels {
                        let mut fixed = PsfIndex([0; NUM_AXES]);
                        fixed.0[AXIS_APERTURE] = aperture;
                        fixed.0[AXIS_FOCUS] = focus;
                        fixed.0[AXIS_CHANNEL] = channel;
                        recipes.push(trilinear_recipe(stack, coords, fixed));
                    }
                }
            }
        }
        Self {
            aperture,
            focus,
            layers,
            channels,
            recipes,
        }
    }

    /// Recipe of texture layer `[defocus, horizontal, vertical]`.
    pub fn recipe_at(&self, layer: [usize; 3], channel: usize) -> &Recipe {
        let [_, nh, nv] = self.layers;
        &self.recipes[((layer[0] * nh + layer[1]) * nv + layer[2]) * self.channels + channel]
    }
}

#[derive(Debug, Clone)]
/// Every (aperture, focus) cache plus the layout they share.
pub struct PsfCacheSet {
    pub texture_layout: TextureLayout,
    pub apertures: usize,
    pub focuses: usize,
    pub caches: Vec<PsfCache>,
}

impl PsfCacheSet {
    pub fn build(stack: &PsfStack, params: &SliceParams) -> Self {
        let shape = stack.shape();
        let (apertures, focuses) = (shape[AXIS_APERTURE], shape[AXIS_FOCUS]);
        let texture_layout = slices_per_axis(stack, params, 0..=apertures - 1, 0..=focuses - 1);
        let caches: Vec<PsfCache> = (0..apertures * focuses)
            .into_par_iter()
            .map(|i| PsfCache::build(stack, &texture_layout, i / focuses, i % focuses))
            .collect();
        debug!(
            layers = ?layout_layers(&texture_layout),
            caches = caches.len(),
            "built PSF interpolation caches"
        );
        Self {
            texture_layout,
            apertures,
            focuses,
            caches,
        }
    }

    pub fn cache(&self, aperture: usize, focus: usize) -> &PsfCache {
        &self.caches[aperture * self.focuses + focus]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the per-frame texture is laid out and stored.
pub struct TextureOptions {
    pub resolution: Resolution,
    pub max_coc: u32,
    pub format: PsfTextureFormat,
    pub depth_layout: PsfTextureDepthLayout,
    pub angle_layout: PsfTextureAngleLayout,
    pub group_size: usize,
}

impl TextureOptions {
    pub fn from_config(config: &BlurConfig, resolution: Resolution) -> Self {
        Self {
            resolution,
            max_coc: config.max_coc,
            format: config.psf_texture_format,
            depth_layout: config.psf_texture_depth_layout,
            angle_layout: config.psf_texture_angle_layout,
            group_size: config.group_sizes.interpolation as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Inputs a texture depends on; a texture is reused while they are unchanged.
pub struct TextureKey {
    aperture: u32,
    focus: u32,
    fovy: u32,
    options: TextureOptions,
}

impl TextureKey {
    pub fn new(camera: &Camera, options: TextureOptions) -> Self {
        Self {
            aperture: camera.aperture_mm.to_bits(),
            focus: camera.focus_dioptres().to_bits(),
            fovy: camera.fovy_deg.to_bits(),
            options,
        }
    }
}

/// Adds `src` (of radius `src_radius`) scaled by `w` into `dst`, centred.
fn accumulate_centered(dst: &mut [f32], dst_radius: u32, src: &[f32], src_radius: u32, w: f32) {
    let dst_side = 2 * dst_radius as i32 + 1;
    let src_side = 2 * src_radius as i32 + 1;
    let shift = dst_radius as i32 - src_radius as i32;
    for sy in 0..src_side {
        let dy = sy + shift;
        if dy < 0 || dy >= dst_side {
            continue;
        }
        for sx in 0..src_side {
            let dx = sx + shift;
            if dx < 0 || dx >= dst_side {
                continue;
            }
            dst[(dy * dst_side + dx) as usize] += w * src[(sy * src_side + sx) as usize];
        }
    }
}

/// Rounds a weight to the precision of `format`. Packed 11/11/10-bit
/// texels keep 6 mantissa bits in red and green and 5 in blue.
pub fn quantize_weight(weight: f32, format: PsfTextureFormat, channel: usize) -> f32 {
    match format {
        PsfTextureFormat::F32 => weight,
        PsfTextureFormat::F16 => f16::from_f32(weight).to_f32(),
        PsfTextureFormat::F11 => {
            let dropped: u16 = if channel % 3 == 2 { 5 } else { 4 };
            let bits = f16::from_f32(weight.max(0.0)).to_bits();
            let rounded = (bits + (1 << (dropped - 1))) & !((1 << dropped) - 1);
            f16::from_bits(rounded).to_f32()
        }
    }
}

/// Blends packed kernels at `radius` and normalizes the result.
fn blend_kernel(
    table: &DerivedPsfTable,
    packed: &PackedWeights,
    corners: &[(u32, f32)],
    radius: u32,
    format: PsfTextureFormat,
    channel: usize,
) -> Kernel {
    let side = 2 * radius as usize + 1;
    let mut weights = vec![0.0f32; side * side];
    for &(id, w) in corners {
        let (used, src) = packed.kernel(table, id as usize, radius);
        accumulate_centered(&mut weights, radius, src, used, w);
    }
    let sum: f32 = weights.iter().sum();
    if sum > 0.0 {
        weights.iter_mut().for_each(|w| *w /= sum);
    }
    weights
        .iter_mut()
        .for_each(|w| *w = quantize_weight(*w, format, channel));
    Kernel {
        size: side,
        weights,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// Texture lookup for one sample.
pub struct TextureSample {
    pub psf_id: u32,
    /// Radius of the kernels stored in the slice.
    pub blur_radius: u32,
    /// Radius interpolated between the neighboring defocus layers.
    pub blur_radius_cont: f32,
    /// Position between the two nearest defocus layers.
    pub lerp_factor: f32,
}

#[derive(Debug, Clone)]
/// Per-frame kernels, one per (slice, channel).
pub struct PsfTexture {
    pub layout: TextureLayout,
    /// Slices along (depth, horizontal, vertical).
    pub layers: [usize; 3],
    pub depth_layout: PsfTextureDepthLayout,
    pub angle_layout: PsfTextureAngleLayout,
    /// Depth slices per defocus layer; 1 unless radius based.
    pub radius_slices: usize,
    pub channels: usize,
    pub kernels: Vec<Kernel>,
    pub areas: Vec<SummedArea>,
    /// Largest kernel radius per slice over its channels.
    pub slice_radius: Vec<u32>,
    /// Unrounded pixel radius per (defocus, horizontal, vertical) layer.
    pub layer_radius: Vec<f32>,
    pub key: TextureKey,
}

impl PsfTexture {
    pub fn build(
        stack: &PsfStack,
        caches: &PsfCacheSet,
        table: &DerivedPsfTable,
        packed: &PackedWeights,
        camera: &Camera,
        options: &TextureOptions,
    ) -> Self {
        let axes = &stack.axes;
        let channels = axes.channels.max(1);
        let layout = caches.texture_layout.clone();
        let [nd, nh, nv] = layout_layers(&layout);
        let max_coc = options.max_coc;

        let aperture = axis_corners(
            axes.aperture.fractional_index(camera.aperture_mm),
            caches.apertures,
        );
        let focus = axis_corners(
            axes.focus.fractional_index(camera.focus_dioptres()),
            caches.focuses,
        );
        let mut bracket: Vec<(&PsfCache, f32)> = Vec::with_capacity(4);
        for &(a, wa) in &aperture {
            for &(f, wf) in &focus {
                if wa * wf > 0.0 {
                    bracket.push((caches.cache(a, f), wa * wf));
                }
            }
        }

        // blended recipe and pixel radius per (layer, channel)
        let blends: Vec<(f32, Vec<(u32, f32)>)> = (0..nd * nh * nv * channels)
            .into_par_iter()
            .with_min_len(options.group_size.max(1))
            .map(|i| {
                let (layer, channel) = (i / channels, i % channels);
                let at = [layer / (nh * nv), (layer / nv) % nh, layer % nv];
                let mut blur_radius_deg = 0.0;
                let mut corners: Vec<(u32, f32)> = Vec::with_capacity(32);
                for &(cache, wc) in &bracket {
                    let recipe = cache.recipe_at(at, channel);
                    blur_radius_deg += wc * recipe.blur_radius_deg;
                    corners.extend(recipe.corners.iter().map(|&(id, w)| (id, w * wc)));
                }
                let radius = blur_radius_pixels(blur_radius_deg, options.resolution.height, camera.fovy_deg)
                    .clamp(0.0, max_coc as f32);
                (radius, corners)
            })
            .collect();
        let layer_radius: Vec<f32> = blends
            .chunks(channels)
            .map(|c| c.iter().map(|b| b.0).fold(0.0, f32::max))
            .collect();

        let radius_slices = match options.depth_layout {
            PsfTextureDepthLayout::DiopterBased => 1,
            PsfTextureDepthLayout::RadiusBased => table.radius_range().1.min(max_coc) as usize + 1,
        };
        let mut texture = Self {
            layout,
            layers: [nd * radius_slices, nh, nv],
            depth_layout: options.depth_layout,
            angle_layout: options.angle_layout,
            radius_slices,
            channels,
            kernels: Vec::new(),
            areas: Vec::new(),
            slice_radius: Vec::new(),
            layer_radius,
            key: TextureKey::new(camera, *options),
        };

        let slice_count = nd * radius_slices * nh * nv;
        let kernels: Vec<Kernel> = (0..slice_count * channels)
            .into_par_iter()
            .with_min_len(options.group_size.max(1))
            .map(|i| {
                let (slice, channel) = (i / channels, i % channels);
                let [depth, lh, lv] = texture.slice_layers(slice as u32);
                let ld = depth / radius_slices;
                let (radius, corners) = &blends[texture.layer_slot(ld, lh, lv) * channels + channel];
                let radius = match options.depth_layout {
                    PsfTextureDepthLayout::DiopterBased => radius.round() as u32,
                    PsfTextureDepthLayout::RadiusBased => (depth % radius_slices) as u32,
                };
                blend_kernel(table, packed, corners, radius, options.format, channel)
            })
            .collect();

        texture.slice_radius = kernels
            .chunks(channels)
            .map(|ks| ks.iter().map(|k| k.radius() as u32).max().unwrap_or(0))
            .collect();
        texture.areas = kernels.par_iter().map(SummedArea::new).collect();
        texture.kernels = kernels;
        debug!(
            layers = ?texture.layers,
            layout = ?texture.depth_layout,
            bytes = texture.size_bytes(),
            "built PSF texture"
        );
        texture
    }

    pub fn slice_count(&self) -> usize {
        self.slice_radius.len()
    }

    fn layer_slot(&self, ld: usize, lh: usize, lv: usize) -> usize {
        (ld * self.layers[1] + lh) * self.layers[2] + lv
    }

    /// Slice holding texture layer `[depth, horizontal, vertical]`.
    pub fn slice_index(&self, layer: [usize; 3]) -> u32 {
        let [nd, nh, nv] = self.layers;
        let [d, h, v] = layer;
        let slice = match self.angle_layout {
            PsfTextureAngleLayout::PsfBased => (d * nh + h) * nv + v,
            PsfTextureAngleLayout::LayerBased => (h * nv + v) * nd + d,
        };
        slice as u32
    }

    /// Texture layer along each axis of a slice.
    pub fn slice_layers(&self, slice: u32) -> [usize; 3] {
        let [nd, nh, nv] = self.layers;
        let slice = slice as usize;
        match self.angle_layout {
            PsfTextureAngleLayout::PsfBased => [slice / (nh * nv), (slice / nv) % nh, slice % nv],
            PsfTextureAngleLayout::LayerBased => [slice % nd, slice / (nd * nv), (slice / nd) % nv],
        }
    }

    /// Defocus layer of a slice, ignoring its radius slot.
    pub fn defocus_layer(&self, slice: u32) -> usize {
        self.slice_layers(slice)[0] / self.radius_slices
    }

    /// Kernels for a fractional (defocus, horizontal, vertical) stack position.
    pub fn sample(&self, coords: [f32; 3]) -> TextureSample {
        let lh = self.layout[1].layer_of(coords[1]);
        let lv = self.layout[2].layer_of(coords[2]);
        let position = self.layout[0].position_of(coords[0]);
        let last = self.layout[0].num_layers() - 1;
        let lo = (position.floor() as usize).min(last);
        let hi = (lo + 1).min(last);
        let t = position - lo as f32;
        let radius_at = |ld: usize| self.layer_radius[self.layer_slot(ld, lh, lv)];
        let blur_radius_cont = radius_at(lo) * (1.0 - t) + radius_at(hi) * t;

        let ld = (position.round() as usize).min(last);
        let depth = match self.depth_layout {
            PsfTextureDepthLayout::DiopterBased => ld,
            PsfTextureDepthLayout::RadiusBased => {
                ld * self.radius_slices + (blur_radius_cont.round() as usize).min(self.radius_slices - 1)
            }
        };
        let psf_id = self.slice_index([depth, lh, lv]);
        TextureSample {
            psf_id,
            blur_radius: self.radius(psf_id),
            blur_radius_cont,
            lerp_factor: t,
        }
    }

    pub fn kernel(&self, slice: u32, channel: usize) -> &Kernel {
        &self.kernels[slice as usize * self.channels + channel.min(self.channels - 1)]
    }

    pub fn area(&self, slice: u32, channel: usize) -> &SummedArea {
        &self.areas[slice as usize * self.channels + channel.min(self.channels - 1)]
    }

    pub fn radius(&self, slice: u32) -> u32 {
        self.slice_radius[slice as usize]
    }

    pub fn size_bytes(&self) -> usize {
        self.kernels.iter().map(|k| k.weights.len() * 4).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::psf::stack::{PsfAxes, PsfAxis};

    fn axes(method_angles: usize) -> PsfAxes {
        PsfAxes {
            defocus: PsfAxis::new(0.0, 4.0, 5),
            horizontal: PsfAxis::new(-30.0, 30.0, method_angles),
            vertical: PsfAxis::single(0.0),
            channels: 1,
            aperture: PsfAxis::new(2.0, 6.0, 3),
            focus: PsfAxis::new(0.0, 1.0, 2),
        }
    }

    fn params(method: PsfAxisMethod) -> SliceParams {
        SliceParams::from_config_vectors(
            method,
            [0.0; 3],
            [0.0; 3],
            Resolution::new(640, 480),
            [40.0, 60.0],
            32,
        )
    }

    fn options(format: PsfTextureFormat) -> TextureOptions {
        TextureOptions {
            resolution: Resolution::new(640, 480),
            max_coc: 32,
            format,
            depth_layout: PsfTextureDepthLayout::DiopterBased,
            angle_layout: PsfTextureAngleLayout::PsfBased,
            group_size: 8,
        }
    }

    fn texture(stack: &PsfStack, slice_params: &SliceParams, camera: &Camera, options: &TextureOptions) -> PsfTexture {
        let table = DerivedPsfTable::compute(
            stack,
            slice_params.method,
            slice_params.resolution,
            slice_params.fovy_limits,
            slice_params.max_coc,
        )
        .unwrap();
        let packed = PackedWeights::pack(stack, &table);
        let caches = PsfCacheSet::build(stack, slice_params);
        PsfTexture::build(stack, &caches, &table, &packed, camera, options)
    }

    fn camera() -> Camera {
        Camera {
            fovy_deg: 50.0,
            fovy_limits_deg: [40.0, 60.0],
            aperture_mm: 3.0,
            focus_distance_m: 2.0,
        }
    }

    #[test]
    fn layout_maps_layers_back_to_coordinates() {
        let layout = SliceLayout {
            base: 0,
            segments: vec![1, 4, 2],
        };
        assert_eq!(layout.num_layers(), 8);
        for layer in 0..layout.num_layers() {
            assert_eq!(layout.layer_of(layout.coordinate_of(layer)), layer);
        }
        assert_eq!(layout.coordinate_of(3), 1.5);
        assert_eq!(layout.layer_of(-3.0), 0);
        assert_eq!(layout.layer_of(99.0), 7);
        assert_eq!(SliceLayout::fixed(4).layer_of(2.7), 0);
    }

    #[test]
    fn on_axis_has_one_slice_per_defocus() {
        let stack = PsfStack::thin_lens(axes(5), 9);
        let layout = slices_per_axis(&stack, &params(PsfAxisMethod::OnAxis), 0..=2, 0..=1);
        assert_eq!(layout_layers(&layout), [5, 1, 1]);
        assert_eq!(layout[1].base, 2);
    }

    #[test]
    fn off_axis_layers_track_radius_change() {
        let stack = PsfStack::thin_lens(axes(5), 9);
        let exact = slices_per_axis(&stack, &params(PsfAxisMethod::OffAxis), 0..=2, 0..=1);
        // defocus gaps change the radius by several pixels, angles barely
        assert!(exact[0].num_layers() > 5);
        let mut reduced = params(PsfAxisMethod::OffAxis);
        reduced.s = [1.0; 3];
        reduced.p = [1.0; 3];
        let coarse = slices_per_axis(&stack, &reduced, 0..=2, 0..=1);
        assert_eq!(coarse[0].num_layers(), 5);
        assert!(coarse[0].num_layers() < exact[0].num_layers());
    }

    #[test]
    fn texture_kernels_are_normalized() {
        let stack = PsfStack::thin_lens(axes(1), 9);
        let texture = texture(&stack, &params(PsfAxisMethod::OnAxis), &camera(), &options(PsfTextureFormat::F32));
        assert_eq!(texture.slice_count(), 5);
        for kernel in &texture.kernels {
            assert!((kernel.sum() - 1.0).abs() < 1e-4);
        }
        // focus at 0.5 D: the 0 D and 1 D slices are the least blurred
        assert!(texture.radius(0) < texture.radius(4));
        assert!(texture.radius(1) < texture.radius(4));
        assert_eq!(texture.areas.len(), texture.kernels.len());
    }

    #[test]
    fn identity_stack_gives_unit_kernels() {
        let stack = PsfStack::identity(axes(1));
        let texture = texture(&stack, &params(PsfAxisMethod::OnAxis), &camera(), &options(PsfTextureFormat::F16));
        assert!(texture.kernels.iter().all(|k| *k == Kernel::identity()));
    }

    #[test]
    fn every_cache_covers_every_texture_layer() {
        // the small aperture alone would need one layer per defocus gap,
        // the large one three
        let axes = PsfAxes {
            defocus: PsfAxis::new(0.0, 4.0, 5),
            horizontal: PsfAxis::single(0.0),
            vertical: PsfAxis::single(0.0),
            channels: 1,
            aperture: PsfAxis::new(1.0, 10.0, 2),
            focus: PsfAxis::single(0.0),
        };
        let stack = PsfStack::thin_lens(axes, 9);
        let slice_params = params(PsfAxisMethod::OffAxis);
        let caches = PsfCacheSet::build(&stack, &slice_params);
        assert_eq!(layout_layers(&caches.texture_layout), [13, 1, 1]);
        for cache in &caches.caches {
            assert_eq!(cache.layers, [13, 1, 1]);
            assert_eq!(cache.recipes.len(), 13);
        }

        let camera = Camera {
            aperture_mm: 1.0,
            ..camera()
        };
        let texture = texture(&stack, &slice_params, &camera, &options(PsfTextureFormat::F32));
        assert_eq!(texture.layer_radius.len(), 13);
        assert!(
            texture.layer_radius.windows(2).all(|w| w[1] > w[0]),
            "{:?}",
            texture.layer_radius
        );
    }

    #[test]
    fn continuous_radius_interpolates_between_layers() {
        let stack = PsfStack::thin_lens(axes(1), 9);
        let texture = texture(&stack, &params(PsfAxisMethod::OnAxis), &camera(), &options(PsfTextureFormat::F32));
        let lo = texture.sample([3.0, 0.0, 0.0]);
        let hi = texture.sample([4.0, 0.0, 0.0]);
        let mid = texture.sample([3.25, 0.0, 0.0]);
        assert_eq!(mid.psf_id, lo.psf_id);
        assert!((mid.lerp_factor - 0.25).abs() < 1e-6);
        let expected = 0.75 * lo.blur_radius_cont + 0.25 * hi.blur_radius_cont;
        assert!((mid.blur_radius_cont - expected).abs() < 1e-4);
        assert_eq!(texture.sample([3.75, 0.0, 0.0]).psf_id, hi.psf_id);
    }

    #[test]
    fn radius_based_texture_holds_every_radius() {
        let stack = PsfStack::thin_lens(axes(1), 9);
        let slice_params = params(PsfAxisMethod::OnAxis);
        let options = TextureOptions {
            depth_layout: PsfTextureDepthLayout::RadiusBased,
            ..options(PsfTextureFormat::F32)
        };
        let texture = texture(&stack, &slice_params, &camera(), &options);
        let table = DerivedPsfTable::compute(&stack, PsfAxisMethod::OnAxis, slice_params.resolution, slice_params.fovy_limits, 32)
            .unwrap();
        let radii = table.radius_range().1 as usize + 1;
        assert_eq!(texture.radius_slices, radii);
        assert_eq!(texture.layers, [5 * radii, 1, 1]);
        for slice in 0..texture.slice_count() as u32 {
            assert_eq!(texture.radius(slice) as usize, slice as usize % radii);
            assert_eq!(texture.defocus_layer(slice), slice as usize / radii);
        }
        let sample = texture.sample([4.0, 0.0, 0.0]);
        assert_eq!(texture.defocus_layer(sample.psf_id), 4);
        assert_eq!(sample.blur_radius, sample.blur_radius_cont.round() as u32);
        assert!(sample.blur_radius > 0);
    }

    #[test]
    fn angle_layout_orders_slices() {
        let stack = PsfStack::thin_lens(axes(5), 9);
        let slice_params = params(PsfAxisMethod::OffAxis);
        let psf_based = texture(&stack, &slice_params, &camera(), &options(PsfTextureFormat::F32));
        let layer_based = texture(
            &stack,
            &slice_params,
            &camera(),
            &TextureOptions {
                angle_layout: PsfTextureAngleLayout::LayerBased,
                ..options(PsfTextureFormat::F32)
            },
        );
        assert_eq!(psf_based.layers, layer_based.layers);
        let [nd, nh, _] = psf_based.layers;
        assert!(nh > 1);
        // angles of one PSF are adjacent, or a whole defocus run per angle
        assert_eq!(psf_based.slice_index([0, 1, 0]), 1);
        assert_eq!(layer_based.slice_index([1, 0, 0]), 1);
        assert_eq!(layer_based.slice_index([0, 1, 0]), nd as u32);
        for slice in 0..layer_based.slice_count() as u32 {
            let at = layer_based.slice_layers(slice);
            assert_eq!(layer_based.slice_index(at), slice);
            let same = psf_based.slice_index(at);
            assert_eq!(layer_based.kernel(slice, 0), psf_based.kernel(same, 0));
        }
    }

    #[test]
    fn off_axis_kernels_grow_with_eccentricity() {
        let stack = PsfStack::thin_lens(axes(5), 9);
        let texture = texture(&stack, &params(PsfAxisMethod::OffAxis), &camera(), &options(PsfTextureFormat::F32));
        assert!(texture.layers[0] > 5);
        assert!(texture.layers[1] > 1);
        for kernel in &texture.kernels {
            assert!((kernel.sum() - 1.0).abs() < 1e-4);
        }
        let centre = texture.sample([4.0, 2.0, 0.0]);
        let edge = texture.sample([4.0, 4.0, 0.0]);
        assert_ne!(centre.psf_id, edge.psf_id);
        assert!(edge.blur_radius_cont > centre.blur_radius_cont);
    }

    #[test]
    fn f11_keeps_fewer_mantissa_bits_than_f16() {
        let w = 0.123_456_7;
        let f16 = quantize_weight(w, PsfTextureFormat::F16, 0);
        let red = quantize_weight(w, PsfTextureFormat::F11, 0);
        let blue = quantize_weight(w, PsfTextureFormat::F11, 2);
        assert_eq!(quantize_weight(w, PsfTextureFormat::F32, 0), w);
        assert!((f16 - w).abs() <= (red - w).abs());
        assert!((red - w).abs() < w / 64.0);
        assert!((blue - w).abs() < w / 32.0);
        assert_eq!(quantize_weight(0.5, PsfTextureFormat::F11, 2), 0.5);
        assert_eq!(quantize_weight(0.0, PsfTextureFormat::F11, 1), 0.0);
    }

    #[test]
    fn accumulate_centered_crops_and_pads() {
        let mut dst = vec![0.0; 9];
        accumulate_centered(&mut dst, 1, &[1.0], 0, 2.0);
        assert_eq!(dst[4], 2.0);
        let mut small = vec![0.0; 1];
        accumulate_centered(&mut small, 0, &[0.5; 9], 1, 1.0);
        assert_eq!(small, vec![0.5]);
    }
}
