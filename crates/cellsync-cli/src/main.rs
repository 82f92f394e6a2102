//! cellsync CLI - Reactive notebooks for linear-document language servers.

mod colors;
mod query;
mod render;
mod settings;
mod sync;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::query::RequestKind;
use crate::settings::BackendArgs;

#[derive(Parser)]
#[command(name = "cellsync")]
#[command(about = "Present dependency-ordered notebooks to language servers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the virtual document of a notebook
    Render {
        /// Path to the notebook description (.json)
        notebook: String,

        /// Also map a position of this cell
        #[arg(long)]
        cell: Option<String>,

        /// Cell-local line (zero-based)
        #[arg(long, default_value = "0")]
        line: u32,

        /// Cell-local character (zero-based)
        #[arg(long, default_value = "0")]
        character: u32,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Keep a backend language server in sync with a notebook file
    Sync {
        /// Path to the notebook description (.json)
        notebook: String,

        #[command(flatten)]
        backend: BackendArgs,
    },

    /// Send one request through the proxy and print the answer
    Query {
        /// Path to the notebook description (.json)
        notebook: String,

        /// Request to send
        #[arg(value_enum)]
        request: RequestKind,

        /// Cell the position belongs to
        #[arg(long)]
        cell: String,

        /// Cell-local line (zero-based)
        #[arg(long, default_value = "0")]
        line: u32,

        /// Cell-local character (zero-based)
        #[arg(long, default_value = "0")]
        character: u32,

        #[command(flatten)]
        backend: BackendArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Render {
            notebook,
            cell,
            line,
            character,
            json,
        } => {
            let config = settings::load(cli.config.as_deref(), None)?;
            render::execute(&notebook, cell.as_deref(), line, character, json, config).await?;
        }

        Commands::Sync { notebook, backend } => {
            let config = settings::load(cli.config.as_deref(), Some(&backend))?;
            sync::execute(&notebook, config).await?;
        }

        Commands::Query {
            notebook,
            request,
            cell,
            line,
            character,
            backend,
        } => {
            let config = settings::load(cli.config.as_deref(), Some(&backend))?;
            query::execute(&notebook, request, &cell, line, character, config).await?;
        }
    }

    Ok(())
}
