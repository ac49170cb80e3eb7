//! Core data types and models

pub mod particle_id;
pub mod property;
pub mod record;
pub mod timeline;

pub use particle_id::*;
pub use property::*;
pub use record::*;
pub use timeline::*;
