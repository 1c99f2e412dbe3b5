//! Component wiring from a loaded [`Config`].
//!
//! [`App`] owns the database pool and the embedding client and builds the
//! index, orchestrator and retriever on demand. The active collection is
//! the `collection_name` kv value when set, else `[index].collection`.

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use notion_index_core::embedding::EmbeddingClient;
use notion_index_core::kv::{ConfigStore, COLLECTION_NAME_KEY, ROOT_ID_KEY};
use notion_index_core::source::DocumentClient;
use notion_index_core::store::VectorIndex;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db;
use crate::embedding::create_client;
use crate::kv_store::SqliteConfigStore;
use crate::migrate::run_migrations;
use crate::notion::NotionClient;
use crate::retrieve::Retriever;
use crate::sqlite_index::SqliteIndex;
use crate::sync::{SyncOptions, SyncOrchestrator};
use crate::writer::SerializedIndex;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub kv: Arc<dyn ConfigStore>,
    pub collection: String,
    pub embedder: Arc<dyn EmbeddingClient>,
}

impl App {
    /// Connect, migrate and resolve the active collection.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = create_client(&config.embedding, config_timeout(&config))?;
        Self::with_embedder(config, embedder).await
    }

    /// Like [`open`](Self::open) with a caller-supplied embedding client.
    pub async fn with_embedder(config: Config, embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let pool = db::connect(&config).await?;
        run_migrations(&pool).await?;
        let kv: Arc<dyn ConfigStore> = Arc::new(SqliteConfigStore::new(pool.clone()));
        let collection = match kv.get(COLLECTION_NAME_KEY).await? {
            Some(name) if !name.trim().is_empty() => name,
            _ => config.index.collection.clone(),
        };
        Ok(Self {
            config,
            pool,
            kv,
            collection,
            embedder,
        })
    }

    /// Resolve the resource root: explicit argument, then the `root_id` kv
    /// value, then `[index].root_id`.
    pub async fn resolve_root(&self, explicit: Option<String>) -> Result<String> {
        if let Some(root) = explicit.filter(|r| !r.trim().is_empty()) {
            return Ok(root);
        }
        if let Some(root) = self.kv.get(ROOT_ID_KEY).await? {
            if !root.trim().is_empty() {
                return Ok(root);
            }
        }
        self.config
            .index
            .root_id
            .clone()
            .context("no resource root: pass one, `nidx config set root_id <id>`, or set [index].root_id")
    }

    pub fn checkpoints(&self) -> CheckpointStore {
        CheckpointStore::new(self.kv.clone(), &self.collection)
    }

    fn require_embeddings(&self) -> Result<()> {
        if !self.config.embedding.is_enabled() {
            bail!(
                "embeddings are disabled; set [embedding].provider to \"openai\" or \"ollama\""
            );
        }
        Ok(())
    }

    /// The active collection's index, created with the embedder's
    /// dimension on first use.
    pub async fn index(&self) -> Result<Arc<dyn VectorIndex>> {
        self.require_embeddings()?;
        let index = SqliteIndex::open(
            self.pool.clone(),
            &self.collection,
            self.embedder.dimension(),
            self.embedder.model_name(),
        )
        .await
        .with_context(|| format!("opening collection '{}'", self.collection))?;
        Ok(Arc::new(SerializedIndex::new(Arc::new(index))))
    }

    /// The active collection if it has been created, without checking it
    /// against the embedder.
    pub async fn existing_index(&self) -> Result<Option<SqliteIndex>> {
        Ok(SqliteIndex::open_existing(self.pool.clone(), &self.collection).await?)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            chunking: self.config.chunking.params(),
            concurrency: self.config.sync.concurrency,
            embed_batch_size: self.config.embedding.batch_size,
            retry: self.config.sync.retry_policy(),
        }
    }

    /// Orchestrator reading from Notion with `NOTION_TOKEN`.
    pub async fn orchestrator(&self) -> Result<SyncOrchestrator> {
        let source = NotionClient::from_env(&self.config.notion, config_timeout(&self.config))?;
        self.orchestrator_with(Arc::new(source)).await
    }

    pub async fn orchestrator_with(&self, source: Arc<dyn DocumentClient>) -> Result<SyncOrchestrator> {
        let index = self.index().await?;
        Ok(SyncOrchestrator::new(
            source,
            self.embedder.clone(),
            index,
            self.checkpoints(),
            self.sync_options(),
        ))
    }

    pub async fn retriever(&self) -> Result<Retriever> {
        let index = self.index().await?;
        Ok(Retriever::new(
            self.embedder.clone(),
            index,
            self.config.sync.retry_policy(),
            &self.config.retrieval,
        ))
    }
}

fn config_timeout(config: &Config) -> Duration {
    Duration::from_secs(config.sync.call_timeout_secs.max(1))
}
