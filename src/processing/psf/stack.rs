use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::Context;
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};

use crate::config::PsfAxisMethod;
use crate::error::{BlurError, BlurResult};

pub const AXIS_DEFOCUS: usize = 0;
pub const AXIS_HORIZONTAL: usize = 1;
pub const AXIS_VERTICAL: usize = 2;
pub const AXIS_CHANNEL: usize = 3;
pub const AXIS_APERTURE: usize = 4;
pub const AXIS_FOCUS: usize = 5;
pub const NUM_AXES: usize = 6;

const EPS: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Evenly sampled simulation axis.
pub struct PsfAxis {
    pub min: f32,
    pub max: f32,
    pub count: usize,
}

impl PsfAxis {
    pub fn new(min: f32, max: f32, count: usize) -> Self {
        Self {
            min,
            max,
            count: count.max(1),
        }
    }

    pub fn single(value: f32) -> Self {
        Self::new(value, value, 1)
    }

    pub fn step(&self) -> f32 {
        if self.count <= 1 {
            0.0
        } else {
            (self.max - self.min) / (self.count - 1) as f32
        }
    }

    pub fn value(&self, index: usize) -> f32 {
        self.min + self.step() * index as f32
    }

    /// Position of `value` along the axis in index units, clamped to the
    /// sampled range.
    pub fn fractional_index(&self, value: f32) -> f32 {
        let step = self.step();
        if step.abs() < EPS || !value.is_finite() {
            return 0.0;
        }
        ((value - self.min) / step).clamp(0.0, (self.count - 1) as f32)
    }

    pub fn center(&self) -> usize {
        self.count / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Sampling of every PSF stack dimension.
pub struct PsfAxes {
    /// Object distance in dioptres.
    pub defocus: PsfAxis,
    /// Incident angle in degrees.
    pub horizontal: PsfAxis,
    pub vertical: PsfAxis,
    /// Number of simulated wavelengths.
    pub channels: usize,
    /// Pupil diameter in millimetres.
    pub aperture: PsfAxis,
    /// Focus distance in dioptres.
    pub focus: PsfAxis,
}

impl PsfAxes {
    /// On-axis sampling for a scene between `near` and `far` metres, with the
    /// focus axis spanning the same range and a single pupil size.
    pub fn for_depth_range(near_m: f32, far_m: f32, aperture_mm: f32, defocus_samples: usize) -> Self {
        let near = 1.0 / near_m.max(1e-3);
        let far = 1.0 / far_m.max(near_m).max(1e-3);
        Self {
            defocus: PsfAxis::new(far, near, defocus_samples.max(2)),
            horizontal: PsfAxis::single(0.0),
            vertical: PsfAxis::single(0.0),
            channels: 1,
            aperture: PsfAxis::single(aperture_mm),
            focus: PsfAxis::new(far, near, 4),
        }
    }

    pub fn shape(&self) -> [usize; NUM_AXES] {
        [
            self.defocus.count,
            self.horizontal.count,
            self.vertical.count,
            self.channels.max(1),
            self.aperture.count,
            self.focus.count,
        ]
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn axis(&self, axis: usize) -> PsfAxis {
        match axis {
            AXIS_DEFOCUS => self.defocus,
            AXIS_HORIZONTAL => self.horizontal,
            AXIS_VERTICAL => self.vertical,
            AXIS_APERTURE => self.aperture,
            AXIS_FOCUS => self.focus,
            _ => PsfAxis::new(0.0, (self.channels.max(1) - 1) as f32, self.channels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Position in the stack: defocus, horizontal, vertical, channel, aperture, focus.
pub struct PsfIndex(pub [usize; NUM_AXES]);

impl PsfIndex {
    pub fn channel(&self) -> usize {
        self.0[AXIS_CHANNEL]
    }

    /// Exactly one axis differs by one. Channels never neighbor each other
    /// and angles only do when the blur varies across the field.
    pub fn is_neighbor(&self, other: &PsfIndex, method: PsfAxisMethod) -> bool {
        let mut differing = 0;
        for axis in 0..NUM_AXES {
            let (a, b) = (self.0[axis], other.0[axis]);
            if a == b {
                continue;
            }
            let allowed = match axis {
                AXIS_CHANNEL => false,
                AXIS_HORIZONTAL | AXIS_VERTICAL => method == PsfAxisMethod::OffAxis,
                _ => true,
            };
            if !allowed || a.abs_diff(b) != 1 {
                return false;
            }
            differing += 1;
        }
        differing == 1
    }

    /// Same-or-adjacent indices along every allowed axis, self included.
    pub fn neighborhood(&self, shape: &[usize; NUM_AXES], method: PsfAxisMethod) -> Vec<PsfIndex> {
        let mut out = vec![*self];
        for axis in 0..NUM_AXES {
            for delta in [-1isize, 1] {
                let Some(v) = self.0[axis].checked_add_signed(delta) else {
                    continue;
                };
                if v >= shape[axis] {
                    continue;
                }
                let mut idx = *self;
                idx.0[axis] = v;
                if self.is_neighbor(&idx, method) {
                    out.push(idx);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Square, row-major weight matrix of odd size.
pub struct Kernel {
    pub size: usize,
    pub weights: Vec<f32>,
}

impl Kernel {
    pub fn identity() -> Self {
        Self {
            size: 1,
            weights: vec![1.0],
        }
    }

    pub fn radius(&self) -> usize {
        self.size / 2
    }

    pub fn sum(&self) -> f32 {
        self.weights.iter().sum()
    }

    /// Weight at an offset from the centre, zero outside the kernel.
    pub fn at(&self, dx: i32, dy: i32) -> f32 {
        let r = self.radius() as i32;
        if dx.abs() > r || dy.abs() > r {
            return 0.0;
        }
        self.weights[(dy + r) as usize * self.size + (dx + r) as usize]
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Prefix sums of a kernel, so any rectangle of offsets sums in O(1).
pub struct SummedArea {
    side: usize,
    /// `(side + 1)²` entries; row y+1, column x+1 holds the sum over rows
    /// `0..=y` and columns `0..=x`.
    sums: Vec<f32>,
}

impl SummedArea {
    pub fn new(kernel: &Kernel) -> Self {
        let side = kernel.size;
        let stride = side + 1;
        let mut sums = vec![0.0f32; stride * stride];
        for y in 0..side {
            let mut row = 0.0;
            for x in 0..side {
                row += kernel.weights[y * side + x];
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { side, sums }
    }

    /// Sum of the weights at offsets `dx` in `x` and `dy` in `y` from the
    /// centre; offsets outside the kernel contribute nothing.
    pub fn sum(&self, x: RangeInclusive<i32>, y: RangeInclusive<i32>) -> f32 {
        let r = (self.side / 2) as i32;
        let clip = |range: RangeInclusive<i32>| {
            let lo = (*range.start()).max(-r);
            let hi = (*range.end()).min(r);
            (lo <= hi).then_some(((lo + r) as usize, (hi + r + 1) as usize))
        };
        let (Some((x0, x1)), Some((y0, y1))) = (clip(x), clip(y)) else {
            return 0.0;
        };
        let stride = self.side + 1;
        let at = |x: usize, y: usize| self.sums[y * stride + x];
        at(x1, y1) - at(x1, y0) - at(x0, y1) + at(x0, y0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfEntry {
    pub kernel: Kernel,
    /// Angular blur radius in degrees.
    pub blur_radius_deg: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Simulated kernels over all six axes, flattened row-major in axis order.
pub struct PsfStack {
    pub axes: PsfAxes,
    pub entries: Vec<PsfEntry>,
}

impl PsfStack {
    pub fn new(axes: PsfAxes, entries: Vec<PsfEntry>) -> BlurResult<Self> {
        let stack = Self { axes, entries };
        stack.check()?;
        Ok(stack)
    }

    fn check(&self) -> BlurResult<()> {
        if self.entries.len() != self.axes.len() || self.entries.is_empty() {
            return Err(BlurError::PsfStack(format!(
                "{} entries for axes of shape {:?}",
                self.entries.len(),
                self.axes.shape()
            )));
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let k = &entry.kernel;
            if k.size % 2 == 0 || k.weights.len() != k.size * k.size {
                return Err(BlurError::PsfStack(format!(
                    "entry {i} kernel is not an odd square ({} weights, size {})",
                    k.weights.len(),
                    k.size
                )));
            }
            if entry.blur_radius_deg.is_nan() || entry.blur_radius_deg < 0.0 {
                return Err(BlurError::PsfStack(format!("entry {i} has a negative blur radius")));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shape(&self) -> [usize; NUM_AXES] {
        self.axes.shape()
    }

    pub fn flat_index(&self, index: &PsfIndex) -> usize {
        let shape = self.shape();
        index
            .0
            .iter()
            .zip(shape.iter())
            .fold(0, |acc, (&i, &n)| acc * n + i)
    }

    pub fn index_of(&self, mut flat: usize) -> PsfIndex {
        let shape = self.shape();
        let mut out = [0; NUM_AXES];
        for axis in (0..NUM_AXES).rev() {
            out[axis] = flat % shape[axis];
            flat /= shape[axis];
        }
        PsfIndex(out)
    }

    pub fn get(&self, index: &PsfIndex) -> &PsfEntry {
        &self.entries[self.flat_index(index)]
    }

    pub fn indices(&self) -> impl Iterator<Item = PsfIndex> + '_ {
        (0..self.len()).map(|flat| self.index_of(flat))
    }

    /// Stack whose kernels do not blur at all.
    pub fn identity(axes: PsfAxes) -> Self {
        let entries = (0..axes.len())
            .map(|_| PsfEntry {
                kernel: Kernel::identity(),
                blur_radius_deg: 0.0,
            })
            .collect();
        Self { axes, entries }
    }

    /// Geometric-optics stack: a pillbox whose angular radius is half the
    /// pupil diameter times the dioptric error, with a little longitudinal
    /// chromatic shift per channel and growth towards the field edge.
    pub fn thin_lens(axes: PsfAxes, samples: usize) -> Self {
        let samples = samples.max(1) | 1;
        let channels = axes.channels.max(1);
        let mid_channel = (channels - 1) as f32 * 0.5;
        let mut stack = Self::identity(axes);
        for flat in 0..stack.len() {
            let idx = stack.index_of(flat);
            let [d, h, v, c, a, f] = idx.0;
            let chroma = 0.15 * (c as f32 - mid_channel);
            let dioptric_error = (axes.defocus.value(d) - axes.focus.value(f) + chroma).abs();
            let pupil_m = axes.aperture.value(a) * 1e-3;
            let eccentricity = axes.horizontal.value(h).hypot(axes.vertical.value(v));
            let radius_rad = 0.5 * pupil_m * dioptric_error * (1.0 + 0.02 * eccentricity);
            let blur_radius_deg = radius_rad.to_degrees();
            let kernel = if blur_radius_deg > EPS {
                pillbox(samples)
            } else {
                Kernel::identity()
            };
            stack.entries[flat] = PsfEntry {
                kernel,
                blur_radius_deg,
            };
        }
        stack
    }

    /// Loads a stack saved with [`PsfStack::save_json`].
    pub fn load_json(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read PSF stack {}", path.display()))?;
        let stack: PsfStack = serde_json::from_str(&json)
            .with_context(|| format!("parse PSF stack {}", path.display()))?;
        stack.check()?;
        Ok(stack)
    }

    pub fn save_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

fn pillbox(samples: usize) -> Kernel {
    let half = (samples / 2) as f32 + 0.5;
    let center = (samples / 2) as f32;
    let mut weights = Vec::with_capacity(samples * samples);
    for y in 0..samples {
        for x in 0..samples {
            let dist = (x as f32 - center).hypot(y as f32 - center);
            weights.push((half - dist).clamp(0.0, 1.0));
        }
    }
    let sum: f32 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= sum);
    Kernel {
        size: samples,
        weights,
    }
}

/// Resamples a PSF to a `(2r+1)²` kernel whose weights sum to one.
pub fn resize_psf_normalized(entry: &PsfEntry, radius: u32) -> Kernel {
    if radius == 0 {
        return Kernel::identity();
    }
    let size = 2 * radius as usize + 1;
    let source = &entry.kernel;
    let mut weights = if source.size == size {
        source.weights.clone()
    } else {
        let side = source.size as u32;
        match ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(side, side, source.weights.clone()) {
            Some(buf) => {
                imageops::resize(&buf, size as u32, size as u32, FilterType::Triangle).into_raw()
            }
            None => vec![0.0; size * size],
        }
    };
    let sum: f32 = weights.iter().sum();
    if sum > EPS {
        weights.iter_mut().for_each(|w| *w /= sum);
    } else {
        weights.iter_mut().for_each(|w| *w = 0.0);
        weights[size * size / 2] = 1.0;
    }
    Kernel { size, weights }
}

/// Source of a PSF stack, run off the render thread.
pub trait PsfProvider: Send + 'static {
    fn name(&self) -> &str;
    fn compute(&self) -> anyhow::Result<PsfStack>;
}

/// Builds a [`PsfStack::thin_lens`] stack.
pub struct ThinLensProvider {
    pub axes: PsfAxes,
    pub samples: usize,
}

impl PsfProvider for ThinLensProvider {
    fn name(&self) -> &str {
        "thin lens"
    }

    fn compute(&self) -> anyhow::Result<PsfStack> {
        Ok(PsfStack::thin_lens(self.axes, self.samples))
    }
}

/// Reads a stack from JSON.
pub struct JsonProvider {
    pub path: PathBuf,
}

impl PsfProvider for JsonProvider {
    fn name(&self) -> &str {
        "json"
    }

    fn compute(&self) -> anyhow::Result<PsfStack> {
        PsfStack::load_json(&self.path)
    }
}
