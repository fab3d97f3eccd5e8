//! # Stagewalk - Survey Sequencer Server
//!
//! Walks each participant through a staged survey one step at a time.
//!
//! This application provides:
//! - HTTP REST API server (axum-based), one sequencer per session
//! - CLI interface for checking sequence files and scripted walks
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │              apps/stagewalk (THE BINARY)             │
//! │                                                      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌────────────┐  │
//! │  │    CLI      │   │  HTTP API   │   │ TOML loader│  │
//! │  │   (clap)    │   │   (axum)    │   │  (config)  │  │
//! │  └──────┬──────┘   └──────┬──────┘   └─────┬──────┘  │
//! │         └─────────────────┼────────────────┘         │
//! │                           ▼                          │
//! │                  ┌────────────────┐                  │
//! │                  │ stagewalk-core │                  │
//! │                  │  (THE LOGIC)   │                  │
//! │                  └────────────────┘                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! # Serve the bundled survey
//! stagewalk server --host 0.0.0.0 --port 8080
//!
//! # Check a sequence file and list skipped steps per treatment
//! stagewalk -c survey.toml check
//!
//! # Walk one session with scripted answers
//! stagewalk walk -t TWTP -a answers.json
//! ```

use clap::Parser;
use stagewalk::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // STAGEWALK_LOG_FORMAT=json switches to machine-parseable output.
    let log_format =
        std::env::var("STAGEWALK_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stagewalk=info,stagewalk_core=info,tower_http=debug".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Print the Stagewalk startup banner.
fn print_banner() {
    println!(
        r#"
  ┌─┐┌┬┐┌─┐┌─┐┌─┐┬ ┬┌─┐┬  ┬┌─
  └─┐ │ ├─┤│ ┬├┤ │││├─┤│  ├┴┐
  └─┘ ┴ ┴ ┴└─┘└─┘└┴┘┴ ┴┴─┘┴ ┴

  Survey Sequencer v{}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
