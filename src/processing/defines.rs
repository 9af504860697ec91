use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::str::FromStr;

use crate::config::{
    AccumulationMethod, BlurConfig, GroupSizes, InputDynamicRange, KernelType, OutputMode, OverlayMode,
    PsfAxisMethod, PsfTextureAngleLayout, PsfTextureDepthLayout, PsfTextureFormat, WeightRescaleMethod,
    WeightScaleMethod,
};
use crate::error::{BlurError, BlurResult};

use super::tiling::{BufferLayout, num_neighbor_tiles_splat, sort_elements_per_thread};

pub const KERNEL_NAMES: [&str; 9] = [
    "psf_cache_interpolate",
    "psf_cache_slice",
    "fragment_buffer_build",
    "fragment_buffer_merge",
    "tile_buffer_build",
    "tile_buffer_splat",
    "tile_buffer_sort_params",
    "tile_buffer_sort",
    "convolution",
];

/// Enum written into the block as its variant index, with one
/// `EnumName_Variant index` line per variant.
pub trait DefineEnum: Copy + PartialEq + Debug + 'static {
    const NAME: &'static str;
    const VARIANTS: &'static [Self];

    fn index(self) -> usize {
        Self::VARIANTS.iter().position(|v| *v == self).unwrap_or(0)
    }
}

impl DefineEnum for AccumulationMethod {
    const NAME: &'static str = "AccumulationMethod";
    const VARIANTS: &'static [Self] = &[Self::Sum, Self::BackToFront, Self::FrontToBack];
}

impl DefineEnum for OutputMode {
    const NAME: &'static str = "OutputMode";
    const VARIANTS: &'static [Self] = &[
        Self::Convolution,
        Self::MergedColor,
        Self::MergedDepth,
        Self::FragmentSize,
        Self::PsfId,
        Self::LerpFactor,
        Self::BlurRadius,
        Self::BlurRadiusFract,
        Self::BlurRadiusCont,
        Self::TileBufferSize,
        Self::Alpha,
        Self::IncidentAngle,
    ];
}

impl DefineEnum for OverlayMode {
    const NAME: &'static str = "OverlayMode";
    const VARIANTS: &'static [Self] = &[
        Self::None,
        Self::TileBorder,
        Self::PsfBorder,
        Self::BlurRadiusBorder,
        Self::ObjectDepthBorder,
    ];
}

impl DefineEnum for PsfAxisMethod {
    const NAME: &'static str = "PsfAxisMethod";
    const VARIANTS: &'static [Self] = &[Self::OnAxis, Self::OffAxis];
}

impl DefineEnum for PsfTextureFormat {
    const NAME: &'static str = "PsfTextureFormat";
    const VARIANTS: &'static [Self] = &[Self::F11, Self::F16, Self::F32];
}

impl DefineEnum for PsfTextureDepthLayout {
    const NAME: &'static str = "PsfTextureDepthLayout";
    const VARIANTS: &'static [Self] = &[Self::RadiusBased, Self::DiopterBased];
}

impl DefineEnum for PsfTextureAngleLayout {
    const NAME: &'static str = "PsfTextureAngleLayout";
    const VARIANTS: &'static [Self] = &[Self::LayerBased, Self::PsfBased];
}

impl DefineEnum for WeightRescaleMethod {
    const NAME: &'static str = "WeightRescaleMethod";
    const VARIANTS: &'static [Self] = &[Self::LinearRescale, Self::AlphaBlend];
}

impl DefineEnum for InputDynamicRange {
    const NAME: &'static str = "InputDynamicRange";
    const VARIANTS: &'static [Self] = &[Self::Hdr, Self::Ldr];
}

impl DefineEnum for WeightScaleMethod {
    const NAME: &'static str = "WeightScaleMethod";
    const VARIANTS: &'static [Self] = &[Self::One, Self::Linear, Self::AreaCircle, Self::AreaSquare];
}

pub fn should_use_debug_kernels(config: &BlurConfig) -> bool {
    match config.kernel_type {
        KernelType::Debug => true,
        KernelType::Release => false,
        KernelType::Auto => {
            config.output_mode != OutputMode::Convolution || config.overlay_mode != OverlayMode::None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelParameters {
    defines: Vec<(String, String)>,
}

impl KernelParameters {
    pub fn from_config(config: &BlurConfig, layout: &BufferLayout) -> Self {
        let mut params = Self::default();
        let merged = config.merged_block_size();
        let groups = &config.group_sizes;

        params.define("MAX_LAYERS", layout.layers);
        params.define("TILE_SIZE", config.tile_size);
        params.define("MAX_COC", config.max_coc);
        params.define("MERGE_STEPS", config.active_merge_presets().len());
        params.define("MERGED_BLOCK_SIZE", merged);
        params.define("MERGED_TILE_SIZE", config.tile_size / merged);
        params.define("GROUP_SIZE_INTERPOLATION", groups.interpolation);
        params.define("GROUP_SIZE_MERGE", groups.merge);
        params.define("GROUP_SIZE_SPLAT", groups.splat);
        params.define("GROUP_SIZE_SORT", groups.sort);
        params.define("GROUP_SIZE_CONVOLUTION", groups.convolution);
        params.define("SORT_ENABLED", config.sort as u32);
        params.define("SORT_SHARED_ARRAY_SIZE", layout.sort_shared_elements);
        params.define(
            "SORT_ELEMENTS_PER_THREAD",
            sort_elements_per_thread(layout.sort_shared_elements, groups.sort),
        );
        params.define("NUM_SORT_ITERATIONS", layout.sort_iterations);
        params.define(
            "NUM_NEIGHBOR_TILES_SPLAT",
            num_neighbor_tiles_splat(config.tile_size, config.max_coc),
        );
        params.define("MAX_PSF_RADIUS", config.max_coc);
        params.define("MAX_PSF_DIAMETER", 2 * config.max_coc + 1);
        params.define("DEBUG_OUTPUT", should_use_debug_kernels(config) as u32);
        params.define_enum("PSF_AXIS_METHOD", config.psf_axis());
        params.define_enum("PSF_TEXTURE_FORMAT", config.psf_texture_format);
        params.define_enum("PSF_TEXTURE_DEPTH_LAYOUT", config.psf_texture_depth_layout);
        params.define_enum("PSF_TEXTURE_ANGLE_LAYOUT", config.psf_texture_angle_layout);
        params.define_enum("INPUT_DYNAMIC_RANGE", config.input_dynamic_range);
        params.define_enum("OUTPUT_MODE", config.output_mode);
        params.define_enum("OVERLAY_MODE", config.overlay_mode);
        params.define_enum("ACCUMULATION_METHOD", config.accumulation);
        params.define_enum("WEIGHT_SCALE_METHOD", config.weight_scale);
        params.define_enum("WEIGHT_RESCALE_METHOD", config.weight_rescale);
        params
    }

    /// Adds or replaces a define.
    pub fn define(&mut self, name: &str, value: impl Display) {
        let value = value.to_string();
        match self.defines.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value,
            None => self.defines.push((name.to_string(), value)),
        }
    }

    pub fn define_enum<E: DefineEnum>(&mut self, name: &str, value: E) {
        for variant in E::VARIANTS {
            self.define(&format!("{}_{variant:?}", E::NAME), variant.index());
        }
        self.define(name, value.index());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn define_block(&self) -> String {
        self.defines
            .iter()
            .map(|(name, value)| format!("#define {name} {value}\n"))
            .collect()
    }

    /// Suffix that distinguishes kernel variants built from different blocks.
    pub fn name_suffix(&self) -> String {
        let part = |name: &str| self.get(name).unwrap_or("0").to_string();
        let mut suffix = format!(
            "_t{}_c{}_l{}_m{}",
            part("TILE_SIZE"),
            part("MAX_COC"),
            part("MAX_LAYERS"),
            part("MERGE_STEPS")
        );
        if part("DEBUG_OUTPUT") != "0" {
            suffix.push_str("_debug");
        }
        suffix
    }
}

/// Reads a define block back into name → value pairs. Blank lines and
/// `//` comments are skipped.
pub fn parse_defines(source: &str) -> BlurResult<BTreeMap<String, String>> {
    let mut defines = BTreeMap::new();
    for line in source.lines().map(str::trim) {
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        let Some(rest) = line.strip_prefix("#define") else {
            return Err(BlurError::KernelParameter {
                name: line.to_string(),
                reason: "expected #define".to_string(),
            });
        };
        let mut parts = rest.split_whitespace();
        let (Some(name), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(BlurError::KernelParameter {
                name: rest.trim().to_string(),
                reason: "expected NAME value".to_string(),
            });
        };
        defines.insert(name.to_string(), value.to_string());
    }
    Ok(defines)
}

fn read<T: FromStr>(defines: &BTreeMap<String, String>, name: &str) -> BlurResult<T> {
    let value = defines.get(name).ok_or_else(|| BlurError::KernelParameter {
        name: name.to_string(),
        reason: "missing".to_string(),
    })?;
    value.parse().map_err(|_| BlurError::KernelParameter {
        name: name.to_string(),
        reason: format!("invalid value {value}"),
    })
}

/// Kernels built from one define block, with the constants the passes use.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSet {
    pub names: Vec<String>,
    pub debug: bool,
    pub tile_size: u32,
    pub max_coc: u32,
    pub merge_steps: usize,
    pub group_sizes: GroupSizes,
    pub sort_shared_elements: u32,
    pub sort_iterations: u32,
}

impl KernelSet {
    pub fn compile(params: &KernelParameters) -> BlurResult<Self> {
        let defines = parse_defines(&params.define_block())?;
        let suffix = params.name_suffix();
        Ok(Self {
            names: KERNEL_NAMES.iter().map(|k| format!("{k}{suffix}")).collect(),
            debug: read::<u32>(&defines, "DEBUG_OUTPUT")? != 0,
            tile_size: read(&defines, "TILE_SIZE")?,
            max_coc: read(&defines, "MAX_COC")?,
            merge_steps: read(&defines, "MERGE_STEPS")?,
            group_sizes: GroupSizes {
                interpolation: read(&defines, "GROUP_SIZE_INTERPOLATION")?,
                merge: read(&defines, "GROUP_SIZE_MERGE")?,
                splat: read(&defines, "GROUP_SIZE_SPLAT")?,
                sort: read(&defines, "GROUP_SIZE_SORT")?,
                convolution: read(&defines, "GROUP_SIZE_CONVOLUTION")?,
            },
            sort_shared_elements: read(&defines, "SORT_SHARED_ARRAY_SIZE")?,
            sort_iterations: read(&defines, "NUM_SORT_ITERATIONS")?,
        })
    }
}
