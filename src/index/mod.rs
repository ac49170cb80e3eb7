//! Indexes built over the ordered store

pub mod unique_ids;
