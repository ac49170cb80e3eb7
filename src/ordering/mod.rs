//! Ordering: slot allocation and the resumable reorder engine

pub mod reorder;
pub mod slots;

pub use reorder::*;
pub use slots::*;
