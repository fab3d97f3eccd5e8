//! # Stagewalk CLI Module
//!
//! ## Available Commands
//!
//! - `server` - Serve participant sessions over HTTP
//! - `check` - Validate a sequence file and print the plan per treatment
//! - `walk` - Run one session from a file of scripted answers
//! - `records` - Dump finalized records from the database

mod commands;

use clap::{Parser, Subcommand};
use stagewalk_core::SequencerError;
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Stagewalk - survey stage/step sequencer
///
/// Walks participants one step at a time through a staged survey,
/// gating each step on validation and skipping steps by treatment and
/// by earlier answers.
#[derive(Parser, Debug)]
#[command(name = "stagewalk")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Sequence file (TOML). Defaults to the bundled warm-glow survey
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the records database
    #[arg(short = 'D', long, global = true, default_value = "stagewalk.db")]
    pub database: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start HTTP server
    Server {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value = "8080")]
        port: u16,

        /// Keep records and snapshots in memory instead of the database
        #[arg(long)]
        in_memory: bool,
    },

    /// Validate the sequence and show which steps each treatment sees
    Check {
        /// Only this treatment
        #[arg(short, long)]
        treatment: Option<String>,
    },

    /// Walk one session with scripted answers
    Walk {
        /// Treatment to run under (defaults to the sequence default)
        #[arg(short, long)]
        treatment: Option<String>,

        /// JSON file: { "<step>": { "<field>": value, ... }, ... }
        #[arg(short, long)]
        answers: PathBuf,
    },

    /// Dump finalized records
    Records {
        /// Only records of this session
        #[arg(short, long)]
        session: Option<String>,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), SequencerError> {
    let blueprint = load_blueprint(cli.config.as_deref())?;
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Server {
            host,
            port,
            in_memory,
        }) => cmd_server(blueprint, &cli.database, in_memory, &host, port).await,
        Some(Commands::Check { treatment }) => {
            cmd_check(&blueprint, treatment.as_deref(), json_mode, cli.verbose)
        }
        Some(Commands::Walk { treatment, answers }) => {
            cmd_walk(&blueprint, treatment.as_deref(), &answers, json_mode)
        }
        Some(Commands::Records { session }) => {
            cmd_records(&cli.database, session.as_deref(), json_mode)
        }
        None => cmd_check(&blueprint, None, json_mode, cli.verbose),
    }
}
