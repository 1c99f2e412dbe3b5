//! CLI command implementations. Results go to stdout; diagnostics go
//! through `tracing`.

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use notion_index_core::kv::{COLLECTION_NAME_KEY, ROOT_ID_KEY};
use notion_index_core::store::{RecordFilter, VectorIndex};

use crate::app::App;
use crate::config::Config;
use crate::sqlite_index::drop_collection;
use crate::sync::SyncReport;

/// Keys that `nidx config get|set` may touch.
pub const SETTABLE_KEYS: &[&str] = &[COLLECTION_NAME_KEY, ROOT_ID_KEY];

pub async fn run_init(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    app.pool.close().await;
    println!("Database initialized successfully.");
    Ok(())
}

pub async fn run_sync(config: Config, root: Option<String>, full: bool) -> Result<()> {
    let app = App::open(config).await?;
    let root_id = app.resolve_root(root).await?;
    let orchestrator = app.orchestrator().await?;
    if full {
        orchestrator.reset_checkpoint().await?;
        info!(collection = %app.collection, "checkpoint cleared for full sync");
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight nodes");
            on_signal.cancel();
        }
    });

    let report = orchestrator.run_sync_with_cancel(&root_id, cancel).await?;
    print_report(&app.collection, &report);
    app.pool.close().await;
    Ok(())
}

fn print_report(collection: &str, report: &SyncReport) {
    println!("sync {} -> {}", report.root_id, collection);
    println!("  run: {}", report.run_id);
    println!("  added: {}", report.added);
    println!("  updated: {}", report.updated);
    println!("  deleted: {}", report.deleted);
    println!("  unchanged: {}", report.unchanged);
    println!(
        "  chunks: {} written, {} removed",
        report.chunks_written, report.chunks_removed
    );
    if report.cancelled {
        println!("  cancelled: {} nodes skipped", report.skipped);
    }
    if !report.failed.is_empty() {
        println!("  failed: {}", report.failed.len());
        for f in &report.failed {
            println!("    {} [{}] {}", f.node_id, f.code, f.reason);
        }
    }
    println!("{}", if report.is_clean() { "ok" } else { "partial" });
}

pub async fn run_search(
    config: Config,
    query: &str,
    k: Option<usize>,
    nodes: Vec<String>,
    context: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("query must not be empty");
    }
    let app = App::open(config).await?;
    let retriever = app.retriever().await?;
    let k = k.unwrap_or(app.config.retrieval.k);
    let filter = (!nodes.is_empty()).then(|| RecordFilter::for_nodes(nodes));

    if context {
        println!("{}", retriever.context(query, &[], k, filter.as_ref()).await?);
        app.pool.close().await;
        return Ok(());
    }

    let results = retriever.retrieve(query, k, filter.as_ref()).await?;
    if results.is_empty() {
        println!("No results.");
    }
    for (i, r) in results.iter().enumerate() {
        println!(
            "{}. [{:.3}] {}",
            i + 1,
            r.score,
            r.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    node: {}", r.source_node_id);
        if let Some(url) = &r.url {
            println!("    url: {}", url);
        }
        println!("    excerpt: \"{}\"", excerpt(&r.text, 160));
        println!("    id: {}", r.chunk_id);
        println!();
    }
    app.pool.close().await;
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((i, _)) => format!("{}...", &flat[..i]),
        None => flat,
    }
}

pub async fn run_status(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    println!("notion-index status");
    println!("  database:    {}", app.config.db.path.display());
    println!("  collection:  {}", app.collection);
    println!(
        "  embedding:   {} ({})",
        app.config.embedding.provider,
        app.embedder.model_name()
    );

    match app.existing_index().await? {
        Some(index) => {
            println!("  dimension:   {}", index.dimension());
            println!("  records:     {}", index.count().await?);
            println!("  documents:   {}", index.list_node_ids().await?.len());
        }
        None => println!("  records:     (collection not created yet)"),
    }

    match app.checkpoints().load().await? {
        Some(cp) => {
            println!("  root:        {}", cp.resource_root_id);
            println!("  last sync:   {}", cp.last_sync_completed_at.to_rfc3339());
            println!("  tracked:     {} nodes", cp.node_version_map.len());
        }
        None => println!("  last sync:   never"),
    }
    app.pool.close().await;
    Ok(())
}

fn check_key(key: &str) -> Result<()> {
    if !SETTABLE_KEYS.contains(&key) {
        bail!(
            "unknown config key '{}' (expected one of: {})",
            key,
            SETTABLE_KEYS.join(", ")
        );
    }
    Ok(())
}

pub async fn run_config_get(config: Config, key: &str) -> Result<()> {
    check_key(key)?;
    let app = App::open(config).await?;
    match app.kv.get(key).await? {
        Some(value) => println!("{}", value),
        None => println!("(unset)"),
    }
    app.pool.close().await;
    Ok(())
}

pub async fn run_config_set(config: Config, key: &str, value: &str) -> Result<()> {
    check_key(key)?;
    if value.trim().is_empty() {
        bail!("value must not be empty");
    }
    let app = App::open(config).await?;
    app.kv.set(key, value).await?;
    println!("{} = {}", key, value);
    app.pool.close().await;
    Ok(())
}

/// Remove every record of the active collection and its checkpoint.
pub async fn run_reset(config: Config) -> Result<()> {
    let app = App::open(config).await?;
    let removed = drop_collection(&app.pool, &app.collection).await?;
    app.checkpoints().clear().await?;
    println!("reset {}: {} records removed", app.collection, removed);
    app.pool.close().await;
    Ok(())
}
