pub mod config;
pub mod error;
pub mod jobs;
pub mod processing;
pub mod renderer;

pub use config::BlurConfig;
pub use error::{BlurError, BlurResult, ConfigError};
pub use renderer::{FrameStats, FrameStatus, RenderOutput, TiledSplatBlur};
