//! deltadex CLI
//!
//! Operator commands for a deltadex index directory.
//!
//! # Commands
//!
//! - `init` - Create a directory from a JSON configuration
//! - `put` / `delete` / `touch` - Mutate records
//! - `migrate` - Add a column to a table
//! - `rebuild` - Rebuild every core index (and its delta)
//! - `delta` - Rebuild delta indexes only
//! - `work` - Run the build worker
//! - `search` - Query an entity
//! - `status` / `jobs` - Inspect indexes and the job queue

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// deltadex main+delta index tools.
#[derive(Parser)]
#[command(name = "deltadex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the index directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Suppress indexer output during builds
    #[arg(global = true, short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an index directory
    Init {
        /// JSON engine configuration (tables and entities)
        #[arg(short, long)]
        schema: Option<PathBuf>,

        /// Replace an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Insert or update a record
    Put {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Record ID
        #[arg(short, long)]
        id: u64,

        /// Column assignments (column=value)
        #[arg(short, long = "set", value_name = "COLUMN=VALUE")]
        set: Vec<String>,
    },

    /// Delete a record
    Delete {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Record ID
        #[arg(short, long)]
        id: u64,
    },

    /// Mark a record of an entity dirty
    Touch {
        /// Entity name
        #[arg(short, long)]
        entity: String,

        /// Record ID
        #[arg(short, long)]
        id: u64,
    },

    /// Add a column to a table
    Migrate {
        /// Table name
        #[arg(short, long)]
        table: String,

        /// Column to add
        #[arg(short, long)]
        column: String,
    },

    /// Rebuild all core indexes
    Rebuild {
        /// Only this entity
        #[arg(short, long)]
        entity: Option<String>,

        /// Enqueue the rebuild for the worker instead of running it
        #[arg(long)]
        enqueue: bool,
    },

    /// Rebuild delta indexes only
    Delta {
        /// Only this entity
        #[arg(short, long)]
        entity: Option<String>,
    },

    /// Run the build worker
    Work {
        /// Drain the queue once and exit
        #[arg(long)]
        once: bool,

        /// Poll interval override in milliseconds
        #[arg(long)]
        poll_ms: Option<u64>,
    },

    /// Search an entity
    Search {
        /// Entity name
        #[arg(short, long)]
        entity: String,

        /// Query (`term`, `field:term`, `prefix*`)
        query: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show index and queue status
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List build jobs
    Jobs {
        /// Requeue failed jobs
        #[arg(short, long)]
        retry: bool,

        /// Show finished jobs too
        #[arg(short, long)]
        all: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = || cli.path.clone().ok_or("Index path required (--path)");
    let quiet = cli.quiet;

    match cli.command {
        Commands::Init { schema, force } => {
            commands::init::run(&path()?, schema.as_deref(), force)?;
        }
        Commands::Put { table, id, set } => {
            commands::put::run(&path()?, &table, id, &set)?;
        }
        Commands::Delete { table, id } => {
            commands::put::delete(&path()?, &table, id)?;
        }
        Commands::Touch { entity, id } => {
            commands::put::touch(&path()?, &entity, id)?;
        }
        Commands::Migrate { table, column } => {
            commands::migrate::run(&path()?, &table, &column)?;
        }
        Commands::Rebuild { entity, enqueue } => {
            commands::rebuild::run(&path()?, entity.as_deref(), enqueue, quiet)?;
        }
        Commands::Delta { entity } => {
            commands::rebuild::delta(&path()?, entity.as_deref(), quiet)?;
        }
        Commands::Work { once, poll_ms } => {
            commands::work::run(&path()?, once, poll_ms, quiet)?;
        }
        Commands::Search {
            entity,
            query,
            format,
        } => {
            commands::search::run(&path()?, &entity, &query, &format)?;
        }
        Commands::Status { format } => {
            commands::status::run(&path()?, &format)?;
        }
        Commands::Jobs { retry, all } => {
            commands::status::jobs(&path()?, retry, all)?;
        }
        Commands::Version => {
            println!("deltadex CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("deltadex core v{}", deltadex_core::VERSION);
        }
    }

    Ok(())
}
