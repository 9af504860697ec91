use thiserror::Error;

use crate::processing::tiling::Resolution;

/// Result type for blur operations
pub type BlurResult<T> = Result<T, BlurError>;

/// Configuration rejected before any buffer is sized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tile size {0} outside supported range 8..=32")]
    TileSize(u32),

    #[error("max circle of confusion {0} outside supported range 8..=128")]
    MaxCoc(u32),

    #[error("max layers must be at least 1")]
    NoLayers,

    #[error("max resolution must be non-zero, got {0}")]
    EmptyResolution(Resolution),

    #[error("{steps} merge steps requested but only {presets} presets (max 4)")]
    MergeSteps { steps: usize, presets: usize },

    #[error("merge block size {block} must be a multiple of {previous} and divide tile size {tile}")]
    MergeBlockSize { block: u32, previous: u32, tile: u32 },

    #[error("sort working set {0} must be a power of two >= 2")]
    SortElements(u32),

    #[error("{name} group size must be non-zero")]
    GroupSize { name: &'static str },

    #[error("{buffer} needs {entries} entries, which overflows 32-bit offsets")]
    OffsetOverflow { buffer: &'static str, entries: u64 },
}

/// Errors that can occur while preparing or rendering a frame
#[derive(Error, Debug)]
pub enum BlurError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("frame {frame} exceeds session maximum {max}")]
    FrameTooLarge { frame: Resolution, max: Resolution },

    #[error("frame has {layers} layers but at most {max} are configured")]
    TooManyLayers { layers: usize, max: u32 },

    #[error("layer {layer} has {len} samples, expected {expected}")]
    LayerSize { layer: usize, len: usize, expected: usize },

    #[error("PSF stack shape mismatch: {0}")]
    PsfStack(String),

    #[error("kernel parameter {name}: {reason}")]
    KernelParameter { name: String, reason: String },
}
