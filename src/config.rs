use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::processing::tiling::{BufferLayout, Resolution};

/// Maximum number of merge passes a frame may run.
pub const MAX_MERGE_STEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Order in which fragments of a tile are accumulated.
pub enum AccumulationMethod {
    Sum,
    BackToFront,
    FrontToBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Quantity written to the output image.
pub enum OutputMode {
    Convolution,
    MergedColor,
    MergedDepth,
    FragmentSize,
    PsfId,
    LerpFactor,
    BlurRadius,
    BlurRadiusFract,
    BlurRadiusCont,
    TileBufferSize,
    Alpha,
    IncidentAngle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Debug overlay drawn on top of the output.
pub enum OverlayMode {
    None,
    TileBorder,
    PsfBorder,
    BlurRadiusBorder,
    ObjectDepthBorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Whether PSFs vary with the incident angle.
pub enum PsfAxisMethod {
    OnAxis,
    OffAxis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Storage precision of the per-frame PSF texture.
pub enum PsfTextureFormat {
    /// 11-bit mantissa-truncated floats, as in packed `r11g11b10` storage.
    F11,
    F16,
    F32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// What the texture's depth axis is indexed by.
pub enum PsfTextureDepthLayout {
    /// One slice per (defocus sample, pixel radius); on-axis only.
    RadiusBased,
    /// Interpolated layers between defocus samples.
    DiopterBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Slice order of the angle layers in a diopter-based texture.
pub enum PsfTextureAngleLayout {
    /// Angle layers outermost; each holds a full defocus run.
    LayerBased,
    /// Defocus outermost; the angles of one PSF are adjacent.
    PsfBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How a merged fragment's weight grows with its block size.
pub enum WeightScaleMethod {
    One,
    Linear,
    AreaCircle,
    AreaSquare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How a scaled weight is brought back to a usable coverage.
pub enum WeightRescaleMethod {
    /// Color and alpha keep the scaled weight as is.
    LinearRescale,
    /// Coverage is clamped to one and color follows the clamped coverage.
    AlphaBlend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Which kernel variant runs.
pub enum KernelType {
    Debug,
    Release,
    /// Debug kernels only while a debug output or overlay is selected.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputDynamicRange {
    Hdr,
    /// Input colors are clamped to `[0, 1]`.
    Ldr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Block size and gates for one merge pass.
pub struct MergePreset {
    pub block_size: u32,
    pub color_similarity: f32,
    pub color_contrast: f32,
    /// Dioptres.
    pub depth_similarity: f32,
    /// Pixels; blocks with any sharper fragment are left alone.
    pub min_blur_radius: f32,
}

impl MergePreset {
    fn with_block(block_size: u32) -> Self {
        Self {
            block_size,
            color_similarity: 0.1,
            color_contrast: 0.1,
            depth_similarity: 0.01,
            min_blur_radius: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Invocations per work group for each pass.
pub struct GroupSizes {
    pub interpolation: u32,
    pub merge: u32,
    pub splat: u32,
    pub sort: u32,
    pub convolution: u32,
}

impl Default for GroupSizes {
    fn default() -> Self {
        Self {
            interpolation: 8,
            merge: 8,
            splat: 32,
            sort: 256,
            convolution: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Persisted blur settings.
pub struct BlurConfig {
    pub tile_size: u32,
    pub max_coc: u32,
    pub max_resolution: Resolution,
    pub max_layers: u32,
    pub merge_steps: usize,
    pub merge_presets: Vec<MergePreset>,
    pub sort: bool,
    pub max_sort_elements: u32,
    pub sort_depth_offset: f32,
    pub sort_depth_scale: f32,
    pub accumulation: AccumulationMethod,
    pub alpha_threshold: f32,
    pub normalize_result: bool,
    pub weight_scale: WeightScaleMethod,
    pub weight_rescale: WeightRescaleMethod,
    pub input_dynamic_range: InputDynamicRange,
    pub kernel_type: KernelType,
    pub output_mode: OutputMode,
    pub overlay_mode: OverlayMode,
    pub psf_axis_method: PsfAxisMethod,
    pub psf_layers_s: [f32; 3],
    pub psf_layers_p: [f32; 3],
    pub psf_texture_format: PsfTextureFormat,
    pub psf_texture_depth_layout: PsfTextureDepthLayout,
    pub psf_texture_angle_layout: PsfTextureAngleLayout,
    /// Metres added to every sample depth.
    pub depth_offset: f32,
    pub group_sizes: GroupSizes,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            tile_size: 16,
            max_coc: 32,
            max_resolution: Resolution::new(1920, 1080),
            max_layers: 2,
            merge_steps: 0,
            merge_presets: [2, 4, 8, 16].into_iter().map(MergePreset::with_block).collect(),
            sort: true,
            max_sort_elements: 512,
            sort_depth_offset: 0.01,
            sort_depth_scale: 0.0,
            accumulation: AccumulationMethod::FrontToBack,
            alpha_threshold: 1.0,
            normalize_result: true,
            weight_scale: WeightScaleMethod::AreaSquare,
            weight_rescale: WeightRescaleMethod::AlphaBlend,
            input_dynamic_range: InputDynamicRange::Ldr,
            kernel_type: KernelType::Auto,
            output_mode: OutputMode::Convolution,
            overlay_mode: OverlayMode::None,
            psf_axis_method: PsfAxisMethod::OnAxis,
            psf_layers_s: [0.0; 3],
            psf_layers_p: [0.0; 3],
            psf_texture_format: PsfTextureFormat::F32,
            psf_texture_depth_layout: PsfTextureDepthLayout::DiopterBased,
            psf_texture_angle_layout: PsfTextureAngleLayout::PsfBased,
            depth_offset: 0.0,
            group_sizes: GroupSizes::default(),
        }
    }
}

impl BlurConfig {
    /// Returns the user config file path, if a config directory is available.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("splatblur").join("config.toml"))
    }

    /// Loads config from disk, falling back to defaults on any error.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        Self::load_from(&path).unwrap_or_default()
    }

    /// Loads config from an explicit path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse config {}", path.display()))
    }

    /// Writes config to disk, ignoring filesystem/serialization errors.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(s) = toml::to_string_pretty(self) {
            let _ = std::fs::write(&path, s);
        }
    }

    /// Block sizes of the active merge passes, in execution order.
    pub fn active_merge_presets(&self) -> &[MergePreset] {
        let steps = self.merge_steps.min(self.merge_presets.len());
        &self.merge_presets[..steps]
    }

    /// Block size of the coarsest active merge pass, 1 when merging is off.
    pub fn merged_block_size(&self) -> u32 {
        self.active_merge_presets()
            .last()
            .map(|p| p.block_size)
            .unwrap_or(1)
    }

    /// Radius-based textures have no angle axes.
    pub fn psf_axis(&self) -> PsfAxisMethod {
        match self.psf_texture_depth_layout {
            PsfTextureDepthLayout::RadiusBased => PsfAxisMethod::OnAxis,
            PsfTextureDepthLayout::DiopterBased => self.psf_axis_method,
        }
    }

    /// Checks ranges and buffer offsets for the session maxima.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(8..=32).contains(&self.tile_size) {
            return Err(ConfigError::TileSize(self.tile_size));
        }
        if !(8..=128).contains(&self.max_coc) {
            return Err(ConfigError::MaxCoc(self.max_coc));
        }
        if self.max_layers == 0 {
            return Err(ConfigError::NoLayers);
        }
        if self.max_resolution.width == 0 || self.max_resolution.height == 0 {
            return Err(ConfigError::EmptyResolution(self.max_resolution));
        }
        if self.merge_steps > MAX_MERGE_STEPS || self.merge_steps > self.merge_presets.len() {
            return Err(ConfigError::MergeSteps {
                steps: self.merge_steps,
                presets: self.merge_presets.len(),
            });
        }
        let mut previous = 1;
        for preset in self.active_merge_presets() {
            let block = preset.block_size;
            if block <= previous || block % previous != 0 || self.tile_size % block != 0 {
                return Err(ConfigError::MergeBlockSize {
                    block,
                    previous,
                    tile: self.tile_size,
                });
            }
            previous = block;
        }
        if self.max_sort_elements < 2 || !self.max_sort_elements.is_power_of_two() {
            return Err(ConfigError::SortElements(self.max_sort_elements));
        }
        let groups = &self.group_sizes;
        for (name, size) in [
            ("interpolation", groups.interpolation),
            ("merge", groups.merge),
            ("splat", groups.splat),
            ("sort", groups.sort),
            ("convolution", groups.convolution),
        ] {
            if size == 0 {
                return Err(ConfigError::GroupSize { name });
            }
        }
        BufferLayout::new(self, self.max_resolution, self.max_layers)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(BlurConfig::default().validate(), Ok(()));
    }

    #[test]
    fn tile_size_outside_range_is_rejected() {
        let config = BlurConfig {
            tile_size: 64,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::TileSize(64)));
    }

    #[test]
    fn merge_blocks_must_nest_inside_tiles() {
        let mut config = BlurConfig {
            tile_size: 8,
            merge_steps: 4,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MergeBlockSize { block: 16, .. })
        ));
        config.merge_steps = 3;
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.merged_block_size(), 8);
    }

    #[test]
    fn huge_session_overflows_offsets() {
        let config = BlurConfig {
            max_resolution: Resolution::new(16384, 16384),
            max_layers: 8,
            max_coc: 128,
            tile_size: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OffsetOverflow { .. })
        ));
    }

    #[test]
    fn toml_round_trip_keeps_enums() {
        let config = BlurConfig {
            accumulation: AccumulationMethod::BackToFront,
            overlay_mode: OverlayMode::TileBorder,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: BlurConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn radius_based_layout_forces_on_axis() {
        let mut config = BlurConfig {
            psf_axis_method: PsfAxisMethod::OffAxis,
            ..Default::default()
        };
        assert_eq!(config.psf_axis(), PsfAxisMethod::OffAxis);
        config.psf_texture_depth_layout = PsfTextureDepthLayout::RadiusBased;
        assert_eq!(config.psf_axis(), PsfAxisMethod::OnAxis);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: BlurConfig = toml::from_str("tile_size = 8\nmax_coc = 16\n").unwrap();
        assert_eq!(parsed.tile_size, 8);
        assert_eq!(parsed.max_coc, 16);
        assert_eq!(parsed.group_sizes, GroupSizes::default());
    }
}
