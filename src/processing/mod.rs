pub mod convolution;
pub mod defines;
pub mod fragment;
pub mod frame;
pub mod merge;
pub mod psf;
pub mod sort;
pub mod tile;
pub mod tiling;

pub use frame::{Camera, FrameLayer, LayeredFrame};
pub use tiling::{BufferLayout, Resolution};
