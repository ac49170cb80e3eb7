//! CLI commands

use crate::config::{ConfigOverrides, TrackConfig};
use crate::core::property::Property;
use crate::core::timeline::TimeWindow;
use crate::error::{Error, Result};
use crate::ordering::reorder::reorder;
use crate::session::{default_store_dir, Query, TimeRequest, TrackSession};
use crate::storage::log_directory::LogDirectory;
use crate::storage::ordered::OrderedStore;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Tracked-particle reorder and query tool
#[derive(Parser, Debug)]
#[command(name = "tracks")]
#[command(about = "Reorder and query tracked-particle dumps")]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Records or slots handled per chunk
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Duration of one simulation step
    #[arg(long, global = true)]
    pub timestep: Option<f64>,

    /// Speed above which a trajectory is reported broken
    #[arg(long, global = true)]
    pub speed_limit: Option<f64>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Location of one species' logs and ordered store
#[derive(Args, Debug, Clone)]
pub struct SpeciesArgs {
    /// Directory holding the disordered logs
    pub dir: PathBuf,
    /// Tracked species name
    pub species: String,
    /// Ordered store directory (default: <dir>/<species>.ordered)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

impl SpeciesArgs {
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .clone()
            .unwrap_or_else(|| default_store_dir(&self.dir, &self.species))
    }
}

/// Session time window
#[derive(Args, Debug, Clone, Default)]
pub struct WindowArgs {
    /// Restrict to the time closest to this value
    #[arg(long, conflicts_with = "between")]
    pub nearest: Option<u64>,
    /// Restrict to times within inclusive bounds
    #[arg(long, num_args = 2, value_names = ["START", "END"])]
    pub between: Option<Vec<u64>>,
}

impl WindowArgs {
    pub fn window(&self) -> TimeWindow {
        match (self.nearest, self.between.as_deref()) {
            (Some(t), _) => TimeWindow::Nearest(t),
            (None, Some([start, end])) => TimeWindow::Between(*start, *end),
            _ => TimeWindow::All,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List tracked species in a log directory
    Species {
        /// Directory holding the disordered logs
        dir: PathBuf,
    },
    /// Order a species' logs into a store, resuming earlier progress
    Order {
        #[command(flatten)]
        target: SpeciesArgs,
    },
    /// Print the available time values
    Times {
        #[command(flatten)]
        target: SpeciesArgs,
    },
    /// Run a selector and print the matching slots
    Select {
        #[command(flatten)]
        target: SpeciesArgs,
        #[command(flatten)]
        window: WindowArgs,
        /// Selector expression, e.g. "any(t>0, px>1)"
        #[arg(default_value = "")]
        query: String,
        /// Select by particle identifiers instead
        #[arg(long, value_delimiter = ',', conflicts_with = "query")]
        ids: Option<Vec<u64>>,
    },
    /// Print selected trajectories as JSON
    Fetch {
        #[command(flatten)]
        target: SpeciesArgs,
        #[command(flatten)]
        window: WindowArgs,
        /// Selector expression
        #[arg(default_value = "")]
        query: String,
        /// Properties to fetch (default: all)
        #[arg(long, value_delimiter = ',')]
        props: Vec<String>,
        /// Fetch a single time value
        #[arg(long)]
        at: Option<u64>,
    },
    /// Stream unsorted records at one time from the logs
    Dump {
        #[command(flatten)]
        target: SpeciesArgs,
        /// Time value
        time: u64,
    },
}

impl Cli {
    /// Resolve the layered configuration for this invocation
    pub fn load_config(&self) -> Result<TrackConfig> {
        TrackConfig::load(
            self.config.as_deref(),
            ConfigOverrides {
                chunk_size: self.chunk_size,
                timestep: self.timestep,
                speed_limit: self.speed_limit,
            },
        )
    }
}

fn open_session(
    target: &SpeciesArgs,
    config: TrackConfig,
    window: TimeWindow,
    cancel: &CancellationToken,
) -> Result<TrackSession> {
    Ok(TrackSession::open(target.store_dir(), config, window)?
        .with_log_dir(&target.dir)
        .with_cancellation(cancel.clone()))
}

/// Run a command to completion, printing results to stdout
pub fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = cli.load_config()?;

    match cli.command {
        Commands::Species { dir } => {
            for species in LogDirectory::species(&dir)? {
                println!("{}", species);
            }
        }
        Commands::Order { target } => {
            let mut logs = LogDirectory::open(&target.dir, &target.species)?;
            let report = reorder(&mut logs, &target.store_dir(), &config, &cancel)?;
            if report.reused {
                println!("{}: already ordered ({} times, {} slots)", target.species, report.total_times, report.total_slots);
            } else {
                println!(
                    "{}: ordered {} of {} times from index {} ({} slots)",
                    target.species, report.ordered, report.total_times, report.resumed_from, report.total_slots
                );
            }
        }
        Commands::Times { target } => {
            let store = OrderedStore::open(target.store_dir())?;
            for time in store.times().times() {
                println!("{}", time);
            }
        }
        Commands::Select {
            target,
            window,
            query,
            ids,
        } => {
            let mut session = open_session(&target, config, window.window(), &cancel)?;
            let query = match ids {
                Some(ids) => Query::Ids(ids),
                None => Query::Expression(query),
            };
            let selection = session.select(&query)?;
            let slots = selection.to_slots(session.total_slots());
            println!("{} particles selected", slots.len());
            println!("{}", serde_json::to_string(&slots)?);
        }
        Commands::Fetch {
            target,
            window,
            query,
            props,
            at,
        } => {
            let props = props
                .iter()
                .map(|p| p.parse::<Property>())
                .collect::<Result<Vec<_>>>()?;
            let mut session = open_session(&target, config, window.window(), &cancel)?;
            session.select(&Query::Expression(query))?;
            let request = at.map(TimeRequest::At).unwrap_or_default();
            let table = session.fetch(&props, request)?;
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Commands::Dump { target, time } => {
            let session = open_session(&target, config.clone(), TimeWindow::All, &cancel)?;
            for (i, chunk) in session.iterate(time, config.chunk_size)?.enumerate() {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let chunk = chunk?;
                eprintln!("chunk {}: {} records", i, chunk.len());
                for record in chunk.records() {
                    println!("{}", serde_json::to_string(&record)?);
                }
            }
        }
    }
    Ok(())
}
