//! particle-tracks: ordered trajectories from disordered particle dumps
//!
//! Every rank of a simulation appends the particles it tracks to its own
//! log, in whatever order they sit in memory. This crate reorders those logs
//! into a store where each particle owns a fixed slot, then answers selector
//! queries and loads time-major trajectories from it.
//!
//! # Core Concepts
//!
//! - **Particle identifier**: packed tag, rank and local index; the slot of a
//!   particle is derived from its rank and local index
//! - **Ordered store**: one `[time, slot]` array per property, ordered one
//!   time-index at a time and resumable after a crash
//! - **Selector**: `any(time_expr, particle_expr)` / `all(...)` clauses
//!   combined by an outer expression
//! - **Trajectory table**: selected slots over time, with a break table for
//!   slots that appear to move faster than the speed limit
//!
//! # Example
//!
//! ```no_run
//! use particle_tracks::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn example() -> particle_tracks::error::Result<()> {
//! let config = TrackConfig::default();
//! let mut logs = LogDirectory::open("results", "electron")?;
//! let store = default_store_dir("results".as_ref(), "electron");
//! reorder(&mut logs, &store, &config, &CancellationToken::new())?;
//!
//! let mut session = TrackSession::open(&store, config, TimeWindow::All)?;
//! session.select(&Query::Expression("any(t>0, px>1)".to_string()))?;
//! let table = session.fetch(&[Property::X, Property::Px], TimeRequest::All)?;
//! println!("{} broken trajectories", table.breaks.broken_count());
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod ordering;
pub mod query;
pub mod storage;
pub mod trajectory;

/// Query sessions over finished stores
pub mod session;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::config::TrackConfig;
    pub use crate::core::*;
    pub use crate::error::{Error, Result};
    pub use crate::ordering::{reorder, ReorderReport};
    pub use crate::query::Selection;
    pub use crate::session::{default_store_dir, Query, TimeRequest, TrackSession};
    pub use crate::storage::*;
    pub use crate::trajectory::{BreakTable, TrajectoryTable};
}
