//! Storage layer: disordered per-rank logs and the ordered store

pub mod array_file;
pub mod lock;
pub mod log_directory;
pub mod log_file;
pub mod manifest;
pub mod ordered;
pub mod source;

pub use lock::*;
pub use log_directory::*;
pub use manifest::*;
pub use ordered::*;
pub use source::*;

// Re-export file-format types that don't conflict
pub use array_file::ArrayFile;
pub use log_file::{LogReader, LogWriter};
