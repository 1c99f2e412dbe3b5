//! # notion-index CLI (`nidx`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nidx init` | Create the SQLite database and run schema migrations |
//! | `nidx sync [root]` | Incrementally sync a Notion subtree into the index |
//! | `nidx search "<query>"` | Retrieve the most similar chunks |
//! | `nidx status` | Show collection, record count and last checkpoint |
//! | `nidx serve` | Start the HTTP trigger surface |
//! | `nidx config get\|set` | Read or write `collection_name` / `root_id` |
//! | `nidx reset` | Drop the collection's records and checkpoint |
//!
//! ## Examples
//!
//! ```bash
//! nidx --config ./config/nidx.toml init
//! nidx sync 1c2d3e4f5a6b7c8d9e0f1a2b3c4d5e6f
//! nidx sync --full
//! nidx search "oncall rotation" --k 3
//! nidx search "release checklist" --context
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use notion_index::{commands, config, logging, server};

/// notion-index: sync a Notion subtree into a vector index and search it.
#[derive(Parser)]
#[command(name = "nidx", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nidx.toml")]
    config: PathBuf,

    /// Debug-level diagnostics (ignored when `RUST_LOG` is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run one incremental sync cycle.
    ///
    /// Pages whose `last_edited_time` is unchanged since the last checkpoint
    /// are not fetched. Ctrl-C stops after in-flight pages finish.
    Sync {
        /// Root page or database id. Defaults to the `root_id` setting.
        root: Option<String>,

        /// Discard the checkpoint and re-embed every page.
        #[arg(long)]
        full: bool,
    },

    /// Search the index.
    Search {
        query: String,

        /// Number of results. Defaults to `[retrieval].k`.
        #[arg(long)]
        k: Option<usize>,

        /// Only return chunks from these node ids (repeatable).
        #[arg(long = "node")]
        nodes: Vec<String>,

        /// Print a formatted context block instead of a result list.
        #[arg(long)]
        context: bool,
    },

    /// Show index and checkpoint status.
    Status,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Read or write persisted settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Delete every record in the active collection and its checkpoint.
    Reset,
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.log, cli.verbose)?;

    match cli.command {
        Commands::Init => commands::run_init(cfg).await?,
        Commands::Sync { root, full } => commands::run_sync(cfg, root, full).await?,
        Commands::Search {
            query,
            k,
            nodes,
            context,
        } => commands::run_search(cfg, &query, k, nodes, context).await?,
        Commands::Status => commands::run_status(cfg).await?,
        Commands::Serve => {
            let app = notion_index::app::App::open(cfg).await?;
            server::run_server(&app).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => commands::run_config_get(cfg, &key).await?,
            ConfigAction::Set { key, value } => {
                commands::run_config_set(cfg, &key, &value).await?
            }
        },
        Commands::Reset => commands::run_reset(cfg).await?,
    }

    Ok(())
}
