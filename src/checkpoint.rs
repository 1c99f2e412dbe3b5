//! Durable sync checkpoint, stored as JSON in the config store under
//! `sync_checkpoint:<collection>`.

use std::sync::Arc;

use tracing::warn;

use notion_index_core::kv::{checkpoint_key, ConfigStore};
use notion_index_core::models::SyncCheckpoint;
use notion_index_core::{Error, Result};

#[derive(Clone)]
pub struct CheckpointStore {
    kv: Arc<dyn ConfigStore>,
    key: String,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn ConfigStore>, collection: &str) -> Self {
        Self {
            kv,
            key: checkpoint_key(collection),
        }
    }

    /// Read the last committed checkpoint.
    ///
    /// A value that does not parse is logged and treated as absent, so the
    /// next cycle re-diffs everything.
    pub async fn load(&self) -> Result<Option<SyncCheckpoint>> {
        let raw = match self.kv.get(&self.key).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match serde_json::from_str(&raw) {
            Ok(cp) => Ok(Some(cp)),
            Err(e) => {
                warn!(key = %self.key, error = %e, "ignoring unreadable checkpoint");
                Ok(None)
            }
        }
    }

    pub async fn save(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        let json = serde_json::to_string(checkpoint)
            .map_err(|e| Error::CheckpointWriteFailure(e.to_string()))?;
        self.kv
            .set(&self.key, &json)
            .await
            .map_err(|e| Error::CheckpointWriteFailure(e.to_string()))
    }

    pub async fn clear(&self) -> Result<()> {
        self.kv
            .delete(&self.key)
            .await
            .map_err(|e| Error::CheckpointWriteFailure(e.to_string()))
    }
}
