use std::sync::mpsc;
use std::time::Instant;

use image::Rgba32FImage;
use tracing::{debug, info, trace, warn};

use crate::config::BlurConfig;
use crate::error::{BlurError, BlurResult};
use crate::jobs::JobQueue;
use crate::processing::convolution::{ConvolutionParams, convolve};
use crate::processing::defines::{KernelParameters, KernelSet};
use crate::processing::fragment::{FragmentBuffer, FragmentClassifier};
use crate::processing::frame::{Camera, LayeredFrame};
use crate::processing::merge::merge_step;
use crate::processing::psf::cache::TextureKey;
use crate::processing::psf::{
    DerivedPsfTable, PackedWeights, PsfCacheSet, PsfProvider, PsfStack, PsfTexture, SliceParams,
    TextureOptions,
};
use crate::processing::sort::{SortBuffers, SortStats};
use crate::processing::tile::TileBuffers;
use crate::processing::tiling::{BufferLayout, Resolution};

pub const JOB_PSF_COMPUTATION: &str = "PSF Computation";
pub const JOB_DERIVED_PARAMS: &str = "Derived PSF Params";
pub const JOB_PSF_UPLOAD: &str = "PSF Data Upload";
pub const JOB_KERNEL_COMPILATION: &str = "Kernel Compilation";
pub const JOB_BUFFER_UPDATE: &str = "Buffer Update";

const JOB_DELAY_FRAMES: u32 = 1;

enum BgResult {
    PsfStack {
        generation: u64,
        provider: String,
        result: Result<PsfStack, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Blurred,
    /// PSF data is not ready yet; the output is the front layer unblurred.
    PsfStackPending,
    /// The blur is switched off; the output is the front layer unblurred.
    Disabled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub frame: u64,
    pub fragments: usize,
    /// Blocks merged by each merge pass.
    pub merged: Vec<usize>,
    pub tile_entries: u64,
    /// Entries dropped this frame because a tile list was full.
    pub overflowed: u64,
    pub total_overflowed: u64,
    pub max_tile_count: u32,
    pub sort_passes: u64,
}

pub struct RenderOutput {
    pub image: Rgba32FImage,
    pub status: FrameStatus,
    pub stats: FrameStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What a config change invalidated.
pub struct ConfigChanges {
    pub psf: bool,
    pub buffers: bool,
    pub kernels: bool,
}

impl ConfigChanges {
    fn between(old: &BlurConfig, new: &BlurConfig) -> Self {
        let psf = old.psf_axis() != new.psf_axis()
            || old.psf_layers_s != new.psf_layers_s
            || old.psf_layers_p != new.psf_layers_p
            || old.max_coc != new.max_coc
            || old.max_resolution != new.max_resolution;
        let buffers = old.tile_size != new.tile_size
            || old.max_coc != new.max_coc
            || old.max_layers != new.max_layers
            || old.max_resolution != new.max_resolution
            || old.active_merge_presets() != new.active_merge_presets()
            || old.max_sort_elements != new.max_sort_elements
            || old.group_sizes != new.group_sizes;
        Self {
            psf,
            buffers,
            kernels: old != new,
        }
    }
}

/// Weight table and interpolation caches for one stack and fovy range.
struct PsfData {
    table: DerivedPsfTable,
    packed: Option<PackedWeights>,
    caches: Option<PsfCacheSet>,
    fovy_limits: [f32; 2],
}

impl PsfData {
    fn derive(stack: &PsfStack, config: &BlurConfig, fovy_limits: [f32; 2]) -> BlurResult<Self> {
        let table = DerivedPsfTable::compute(
            stack,
            config.psf_axis(),
            config.max_resolution,
            fovy_limits,
            config.max_coc,
        )?;
        Ok(Self {
            table,
            packed: None,
            caches: None,
            fovy_limits,
        })
    }

    fn upload(&mut self, stack: &PsfStack, config: &BlurConfig) {
        let params = SliceParams::from_config_vectors(
            config.psf_axis(),
            config.psf_layers_s,
            config.psf_layers_p,
            config.max_resolution,
            self.fovy_limits,
            config.max_coc,
        );
        self.packed = Some(PackedWeights::pack(stack, &self.table));
        self.caches = Some(PsfCacheSet::build(stack, &params));
    }

    fn is_ready(&self) -> bool {
        self.packed.is_some() && self.caches.is_some()
    }
}

struct FrameBuffers {
    layout: BufferLayout,
    fragments: FragmentBuffer,
    tiles: TileBuffers,
    sort: SortBuffers,
}

impl FrameBuffers {
    fn new(layout: BufferLayout, sort_group_size: u32) -> Self {
        Self {
            fragments: FragmentBuffer::new(&layout),
            tiles: TileBuffers::new(&layout),
            sort: SortBuffers::new(&layout, sort_group_size),
            layout,
        }
    }
}

pub struct TiledSplatBlur {
    config: BlurConfig,
    jobs: JobQueue<TiledSplatBlur>,
    stack: Option<PsfStack>,
    psf: Option<PsfData>,
    texture: Option<PsfTexture>,
    kernels: Option<KernelSet>,
    buffers: Option<FrameBuffers>,
    /// Shape of the last frame, used to size buffers ahead of the next one.
    last_shape: Option<(Resolution, u32)>,
    /// Fovy range the PSF data covers: the camera's limits grown to its fovy.
    fovy_limits: [f32; 2],
    enabled: bool,
    psf_generation: u64,
    frame: u64,
    total_overflowed: u64,
    tx: mpsc::SyncSender<BgResult>,
    rx: mpsc::Receiver<BgResult>,
}

impl TiledSplatBlur {
    pub fn new(config: BlurConfig) -> BlurResult<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::sync_channel(4);
        Ok(Self {
            config,
            jobs: JobQueue::new(),
            stack: None,
            psf: None,
            texture: None,
            kernels: None,
            buffers: None,
            last_shape: None,
            fovy_limits: Camera::default().fovy_limits_deg,
            enabled: true,
            psf_generation: 0,
            frame: 0,
            total_overflowed: 0,
            tx,
            rx,
        })
    }

    pub fn config(&self) -> &BlurConfig {
        &self.config
    }

    pub fn kernels(&self) -> Option<&KernelSet> {
        self.kernels.as_ref()
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_job_pending(&self, name: &str) -> bool {
        self.jobs.is_pending(name)
    }

    pub fn has_psf_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// While disabled, frames pass through and only jobs posted as
    /// always-complete keep counting down.
    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            info!(enabled, "blur toggled");
        }
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Installs a stack and derives its PSF data right away.
    pub fn set_psf_stack(&mut self, stack: PsfStack) -> BlurResult<()> {
        let mut psf = PsfData::derive(&stack, &self.config, self.fovy_limits)?;
        psf.upload(&stack, &self.config);
        info!(entries = stack.len(), shape = ?stack.shape(), "PSF stack ready");
        self.stack = Some(stack);
        self.psf = Some(psf);
        self.texture = None;
        Ok(())
    }

    fn rebuild_psf_data(&mut self) -> BlurResult<()> {
        let Some(stack) = self.stack.as_ref() else {
            return Ok(());
        };
        let mut psf = PsfData::derive(stack, &self.config, self.fovy_limits)?;
        psf.upload(stack, &self.config);
        self.psf = Some(psf);
        self.texture = None;
        Ok(())
    }

    /// Computes a stack on a background thread; frames are passed through
    /// until it arrives. A newer request supersedes an older one.
    pub fn request_psf_stack<P: PsfProvider>(&mut self, provider: P) {
        self.psf_generation += 1;
        let generation = self.psf_generation;
        self.jobs
            .post_job(JOB_PSF_COMPUTATION, true, JOB_DELAY_FRAMES, move |r: &mut TiledSplatBlur| {
                let tx = r.tx.clone();
                std::thread::spawn(move || {
                    let result = provider.compute().map_err(|e| format!("{e:#}"));
                    let _ = tx.send(BgResult::PsfStack {
                        generation,
                        provider: provider.name().to_string(),
                        result,
                    });
                });
            });
    }

    /// Applies a new config; invalidated state is rebuilt by delayed jobs.
    pub fn set_config(&mut self, config: BlurConfig) -> BlurResult<ConfigChanges> {
        config.validate()?;
        let changes = ConfigChanges::between(&self.config, &config);
        self.config = config;
        if changes.psf {
            self.psf = None;
            self.texture = None;
            self.jobs
                .post_job(JOB_DERIVED_PARAMS, false, JOB_DELAY_FRAMES, |r: &mut TiledSplatBlur| {
                    r.derive_psf_params()
                });
        }
        if changes.buffers {
            self.buffers = None;
            self.jobs
                .post_job(JOB_BUFFER_UPDATE, false, JOB_DELAY_FRAMES, |r: &mut TiledSplatBlur| {
                    if let Some((resolution, layers)) = r.last_shape {
                        if let Err(e) = r.ensure_buffers(resolution, layers) {
                            warn!("buffer update failed: {e}");
                        }
                    }
                });
        }
        if changes.kernels {
            self.kernels = None;
            self.jobs
                .post_job(JOB_KERNEL_COMPILATION, false, JOB_DELAY_FRAMES, |r: &mut TiledSplatBlur| {
                    let layout = r.buffers.as_ref().map(|b| b.layout.clone());
                    if let Some(layout) = layout {
                        if let Err(e) = r.compile_kernels(&layout) {
                            warn!("kernel compilation failed: {e}");
                        }
                    }
                });
        }
        debug!(?changes, "config updated");
        Ok(changes)
    }

    fn derive_psf_params(&mut self) {
        let Some(stack) = self.stack.as_ref() else {
            return;
        };
        match PsfData::derive(stack, &self.config, self.fovy_limits) {
            Ok(psf) => {
                self.psf = Some(psf);
                self.jobs.post_job(JOB_PSF_UPLOAD, true, 0, |r: &mut TiledSplatBlur| {
                    if let (Some(stack), Some(psf)) = (r.stack.as_ref(), r.psf.as_mut()) {
                        psf.upload(stack, &r.config);
                    }
                });
            }
            Err(e) => warn!("deriving PSF parameters failed: {e}"),
        }
    }

    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                BgResult::PsfStack {
                    generation,
                    provider,
                    result,
                } => {
                    if generation != self.psf_generation {
                        debug!(%provider, generation, "dropping superseded PSF stack");
                        continue;
                    }
                    match result {
                        Ok(stack) => {
                            if let Err(e) = self.set_psf_stack(stack) {
                                warn!(%provider, "PSF stack rejected: {e}");
                            }
                        }
                        Err(e) => warn!(%provider, "PSF computation failed: {e}"),
                    }
                }
            }
        }
    }

    fn compile_kernels(&mut self, layout: &BufferLayout) -> BlurResult<()> {
        let params = KernelParameters::from_config(&self.config, layout);
        let set = KernelSet::compile(&params)?;
        debug!(kernel = %set.names[0], debug = set.debug, "compiled kernels");
        self.kernels = Some(set);
        Ok(())
    }

    /// Resizes every frame buffer when the layout for this shape differs.
    fn ensure_buffers(&mut self, resolution: Resolution, layers: u32) -> BlurResult<()> {
        let layout = BufferLayout::new(&self.config, resolution, layers)?;
        if self.buffers.as_ref().map(|b| &b.layout) != Some(&layout) {
            info!(
                %resolution,
                layers,
                tiles = layout.tile_count(),
                tile_capacity = layout.tile_per_entry,
                "resizing frame buffers"
            );
            self.buffers = Some(FrameBuffers::new(layout.clone(), self.config.group_sizes.sort));
            self.kernels = None;
        }
        if self.kernels.is_none() {
            self.compile_kernels(&layout)?;
        }
        Ok(())
    }

    /// Byte size of every allocated buffer.
    pub fn buffer_sizes(&self) -> Vec<(&'static str, usize)> {
        let mut sizes = Vec::new();
        if let Some(b) = &self.buffers {
            sizes.push((
                "fragments",
                b.fragments.fragments.len() * std::mem::size_of::<crate::processing::fragment::Fragment>(),
            ));
            sizes.push(("tiles", b.tiles.size_bytes()));
            sizes.push(("sort", b.sort.size_bytes()));
        }
        if let Some(packed) = self.psf.as_ref().and_then(|p| p.packed.as_ref()) {
            sizes.push(("psf weights", packed.size_bytes()));
        }
        if let Some(texture) = &self.texture {
            sizes.push(("psf texture", texture.size_bytes()));
        }
        sizes
    }

    fn pass_through(frame: &LayeredFrame, status: FrameStatus, index: u64, total_overflowed: u64) -> RenderOutput {
        RenderOutput {
            image: frame.to_image(),
            status,
            stats: FrameStats {
                frame: index,
                total_overflowed,
                ..Default::default()
            },
        }
    }

    pub fn render(&mut self, frame: &LayeredFrame, camera: &Camera) -> BlurResult<RenderOutput> {
        self.frame += 1;
        for job in self.jobs.take_due(self.enabled) {
            job.run(self);
        }
        self.drain();
        if !self.enabled {
            return Ok(Self::pass_through(frame, FrameStatus::Disabled, self.frame, self.total_overflowed));
        }

        frame.validate()?;
        if !frame.resolution.fits_within(self.config.max_resolution) {
            return Err(BlurError::FrameTooLarge {
                frame: frame.resolution,
                max: self.config.max_resolution,
            });
        }
        if frame.layers.len() > self.config.max_layers as usize {
            return Err(BlurError::TooManyLayers {
                layers: frame.layers.len(),
                max: self.config.max_layers,
            });
        }
        let layers = frame.layer_count().max(1);
        self.last_shape = Some((frame.resolution, layers));

        let [lo, hi] = camera.fovy_limits_deg;
        let fovy_limits = [lo.min(camera.fovy_deg), hi.max(camera.fovy_deg)];
        if fovy_limits != self.fovy_limits {
            if fovy_limits != camera.fovy_limits_deg {
                warn!(fovy = camera.fovy_deg, limits = ?camera.fovy_limits_deg, "camera fovy outside its limits");
            }
            self.fovy_limits = fovy_limits;
            info!(fovy_limits = ?self.fovy_limits, "fovy range changed, rebuilding PSF data");
            self.rebuild_psf_data()?;
        }
        if !self.psf.as_ref().is_some_and(PsfData::is_ready) || self.stack.is_none() {
            debug!(frame = self.frame, "PSF data pending, passing frame through");
            return Ok(Self::pass_through(frame, FrameStatus::PsfStackPending, self.frame, self.total_overflowed));
        }

        self.ensure_buffers(frame.resolution, layers)?;

        let config = &self.config;
        let (Some(stack), Some(psf), Some(kernels), Some(buffers)) = (
            self.stack.as_ref(),
            self.psf.as_ref(),
            self.kernels.as_ref(),
            self.buffers.as_mut(),
        ) else {
            return Ok(Self::pass_through(frame, FrameStatus::PsfStackPending, self.frame, self.total_overflowed));
        };
        let (Some(packed), Some(caches)) = (psf.packed.as_ref(), psf.caches.as_ref()) else {
            return Ok(Self::pass_through(frame, FrameStatus::PsfStackPending, self.frame, self.total_overflowed));
        };
        assert_eq!(buffers.layout, BufferLayout::new(config, frame.resolution, layers)?);
        assert_eq!(kernels.tile_size, buffers.layout.tile_size);
        assert_eq!(kernels.sort_shared_elements, buffers.layout.sort_shared_elements);

        let options = TextureOptions {
            max_coc: kernels.max_coc,
            group_size: kernels.group_sizes.interpolation as usize,
            ..TextureOptions::from_config(config, frame.resolution)
        };
        let key = TextureKey::new(camera, options);
        if self.texture.as_ref().map(|t| t.key) != Some(key) {
            self.texture = Some(PsfTexture::build(stack, caches, &psf.table, packed, camera, &options));
        }
        let Some(texture) = self.texture.as_ref() else {
            return Ok(Self::pass_through(frame, FrameStatus::PsfStackPending, self.frame, self.total_overflowed));
        };

        let groups = &kernels.group_sizes;
        let classifier = FragmentClassifier {
            texture,
            axes: &stack.axes,
            camera: *camera,
            resolution: frame.resolution,
        };
        let mut t0 = Instant::now();
        let fragments = buffers
            .fragments
            .build(frame, &classifier, config.depth_offset, config.input_dynamic_range);
        trace!(pass = "build", ms = elapsed_ms(&mut t0));

        let mut merged = Vec::with_capacity(kernels.merge_steps);
        let mut previous = 1;
        for preset in config.active_merge_presets().iter().take(kernels.merge_steps) {
            merged.push(merge_step(
                &mut buffers.fragments,
                &classifier,
                preset,
                previous,
                groups.merge as usize,
            ));
            previous = preset.block_size;
            trace!(pass = "merge", block = preset.block_size, ms = elapsed_ms(&mut t0));
        }

        buffers.tiles.clear();
        buffers.tiles.build_centers(&buffers.fragments);
        buffers.tiles.write_splat_commands(groups.splat);
        let splat = buffers.tiles.splat(&buffers.fragments, groups.splat);
        trace!(pass = "splat", ms = elapsed_ms(&mut t0));
        if splat.overflowed > 0 {
            warn!(
                overflowed = splat.overflowed,
                capacity = buffers.layout.tile_per_entry,
                "tile lists overflowed, entries dropped"
            );
        }

        let sorted = if config.sort {
            buffers.sort.write_params(&buffers.tiles);
            buffers.sort.sort_tiles(
                &buffers.tiles,
                &buffers.fragments,
                config.sort_depth_offset,
                config.sort_depth_scale,
            )
        } else {
            SortStats::default()
        };
        trace!(pass = "sort", passes = sorted.passes, ms = elapsed_ms(&mut t0));

        let params = ConvolutionParams {
            group_size: groups.convolution,
            ..ConvolutionParams::from_config(config)
        };
        let image = convolve(&buffers.fragments, &buffers.tiles, texture, frame.resolution, &params);
        trace!(pass = "convolve", ms = elapsed_ms(&mut t0));

        self.total_overflowed += splat.overflowed;
        let stats = FrameStats {
            frame: self.frame,
            fragments,
            merged,
            tile_entries: splat.entries,
            overflowed: splat.overflowed,
            total_overflowed: self.total_overflowed,
            max_tile_count: splat.max_tile_count,
            sort_passes: sorted.passes,
        };
        debug!(?stats, "rendered frame");
        Ok(RenderOutput {
            image,
            status: FrameStatus::Blurred,
            stats,
        })
    }
}

/// Milliseconds since `t0`, restarting the clock.
fn elapsed_ms(t0: &mut Instant) -> f64 {
    let ms = t0.elapsed().as_secs_f64() * 1000.0;
    *t0 = Instant::now();
    ms
}
