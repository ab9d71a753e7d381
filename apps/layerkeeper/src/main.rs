//! # layerkeeper
//!
//! Temporal layered configuration management database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                apps/layerkeeper (binary)             │
//! │                                                      │
//! │   ┌─────────────┐            ┌─────────────┐         │
//! │   │    CLI      │            │  HTTP API   │         │
//! │   │   (clap)    │            │   (axum)    │         │
//! │   └──────┬──────┘            └──────┬──────┘         │
//! │          └──────────────┬───────────┘                │
//! │                         ▼                            │
//! │               ┌───────────────────┐                  │
//! │               │ layerkeeper-core  │                  │
//! │               │ merge, traits,    │                  │
//! │               │ ledgers, storage  │                  │
//! │               └───────────────────┘                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! layerkeeper init
//! layerkeeper layer create base
//! layerkeeper ci create --id 3f0c...
//! layerkeeper attr set 3f0c... __name --value db01 --layer base
//! layerkeeper ci show 3f0c... --layers override,base
//! layerkeeper server --port 8080
//! ```

use clap::Parser;
use layerkeeper::cli;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // LAYERKEEPER_LOG_FORMAT=json switches to machine-parseable output.
    let log_format =
        std::env::var("LAYERKEEPER_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let cli = cli::Cli::parse();

    let default_filter = if cli.verbose {
        "layerkeeper=debug,layerkeeper_core=debug,tower_http=debug"
    } else {
        "layerkeeper=info,layerkeeper_core=info,tower_http=debug"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

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
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }

    if !cli.quiet && !cli.json_mode {
        print_banner();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_banner() {
    println!(
        r#"
  ╦  ┌─┐┬ ┬┌─┐┬─┐╦╔═┌─┐┌─┐┌─┐┌─┐┬─┐
  ║  ├─┤└┬┘├┤ ├┬┘╠╩╗├┤ ├┤ ├─┘├┤ ├┬┘
  ╩═╝┴ ┴ ┴ └─┘┴└─╩ ╩└─┘└─┘┴  └─┘┴└─

  layerkeeper v{}

  Layered • Temporal • Trait-typed
"#,
        env!("CARGO_PKG_VERSION")
    );
}
