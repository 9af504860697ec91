pub mod cache;
pub mod params;
pub mod stack;

pub use cache::{PsfCacheSet, PsfTexture, SliceParams, TextureOptions, TextureSample};
pub use params::{DerivedPsfTable, PackedWeights};
pub use stack::{PsfAxes, PsfAxis, PsfProvider, PsfStack};
