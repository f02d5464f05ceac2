//! modgraph command-line tool
//!
//! Loads a module graph from disk (or any URL the default fetchers serve)
//! and prints the root module's namespace.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Once;

mod commands;

#[derive(Parser)]
#[command(name = "modgraph")]
#[command(about = "Load, link and evaluate module graphs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a module and print its namespace
    Run {
        /// File path or absolute URL of the root module
        target: String,
        /// Loader configuration file (modgraph.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// package.json whose dependencies become bare-specifier mappings
        #[arg(short, long)]
        manifest: Option<PathBuf>,
        /// Extra mapping, `specifier=url` (repeatable)
        #[arg(long = "map", value_name = "SPEC=URL")]
        mappings: Vec<String>,
    },

    /// Resolve a specifier against a referrer URL and print the result
    Resolve {
        /// Import specifier
        specifier: String,
        /// Referrer URL
        referrer: String,
        /// Loader configuration file (modgraph.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

static TRACING_INIT: Once = Once::new();

/// Enable with `RUST_LOG=modgraph_loader=debug`; events go to stderr
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, prelude::*, EnvFilter};

        // Only initialize if RUST_LOG is set
        if std::env::var("RUST_LOG").is_ok() {
            let filter = EnvFilter::from_default_env();
            tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_level(true)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .init();
        }
    });
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            config,
            manifest,
            mappings,
        } => commands::run::execute(commands::run::RunArgs {
            target,
            config,
            manifest,
            mappings,
        }),

        Commands::Resolve {
            specifier,
            referrer,
            config,
        } => commands::resolve::execute(&specifier, &referrer, config.as_deref()),
    }
}
