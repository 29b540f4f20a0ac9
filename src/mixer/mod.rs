//! Media mixers
//!
//! Pure composition kernels used by the per-recipient server tasks:
//! - Grid layout and tile allocation
//! - RGB-to-glyph rendering with ANSI color
//! - Audio window summation with soft limiting
//!
//! Nothing here does I/O or touches locks; the server snapshots its
//! registry and calls in.

pub mod ascii;
pub mod audio;
pub mod layout;
pub mod video;

pub use ascii::{ColorMode, Palette};
pub use layout::{grid_shape, tile_rects, GridSpec, TileRect};
pub use video::{compose, TileSource, Viewport};
