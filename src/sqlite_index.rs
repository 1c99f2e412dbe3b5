//! SQLite-backed [`VectorIndex`] implementation.
//!
//! Records live in `vector_records`, keyed by `(collection, chunk_id)`.
//! Embeddings are stored as little-endian `f32` BLOBs and searched by
//! brute-force cosine similarity. The `collections` table pins each
//! collection's dimension; opening it with another dimension fails with
//! `EmbeddingDimensionMismatch`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeSet;

use notion_index_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use notion_index_core::models::{RecordMetadata, VectorRecord};
use notion_index_core::store::{top_k, RecordFilter, ReplaceOutcome, SearchHit, VectorIndex};
use notion_index_core::{Error, Result};

/// A registered collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub model: String,
}

/// Look up a collection's registry entry.
pub async fn collection_info(pool: &SqlitePool, name: &str) -> Result<Option<CollectionInfo>> {
    let row = sqlx::query("SELECT name, dimension, model FROM collections WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .map_err(read_err)?;
    Ok(row.map(|r| {
        let dimension: i64 = r.get("dimension");
        CollectionInfo {
            name: r.get("name"),
            dimension: dimension as usize,
            model: r.get("model"),
        }
    }))
}

/// Delete a collection's records and its registry entry, so it can be
/// recreated with another dimension. Returns the number of records removed.
pub async fn drop_collection(pool: &SqlitePool, name: &str) -> Result<usize> {
    let mut tx = pool.begin().await.map_err(write_err)?;
    let done = sqlx::query("DELETE FROM vector_records WHERE collection = ?")
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;
    sqlx::query("DELETE FROM collections WHERE name = ?")
        .bind(name)
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;
    tx.commit().await.map_err(write_err)?;
    Ok(done.rows_affected() as usize)
}

/// SQLite implementation of the [`VectorIndex`] trait for one collection.
pub struct SqliteIndex {
    pool: SqlitePool,
    collection: String,
    dimension: usize,
}

impl SqliteIndex {
    /// Open `collection`, registering it with `dimension` and `model` on
    /// first use.
    pub async fn open(
        pool: SqlitePool,
        collection: &str,
        dimension: usize,
        model: &str,
    ) -> Result<Self> {
        match collection_info(&pool, collection).await? {
            Some(info) if info.dimension != dimension => {
                return Err(Error::EmbeddingDimensionMismatch {
                    expected: info.dimension,
                    actual: dimension,
                });
            }
            Some(_) => {}
            None => {
                sqlx::query(
                    "INSERT INTO collections (name, dimension, model, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(collection)
                .bind(dimension as i64)
                .bind(model)
                .bind(Utc::now().timestamp())
                .execute(&pool)
                .await
                .map_err(write_err)?;
            }
        }
        Ok(Self {
            pool,
            collection: collection.to_string(),
            dimension,
        })
    }

    /// Open a collection that is already registered, using its stored
    /// dimension. Returns `None` if it has never been created.
    pub async fn open_existing(pool: SqlitePool, collection: &str) -> Result<Option<Self>> {
        Ok(collection_info(&pool, collection).await?.map(|info| Self {
            pool,
            collection: info.name,
            dimension: info.dimension,
        }))
    }

    fn check_dimensions(&self, records: &[VectorRecord]) -> Result<()> {
        match records.iter().find(|r| r.embedding.len() != self.dimension) {
            Some(bad) => Err(Error::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: bad.embedding.len(),
            }),
            None => Ok(()),
        }
    }

    /// Append `AND ...` clauses for `filter` to a query over `vector_records`.
    fn push_filter<'a>(&self, qb: &mut QueryBuilder<'a, Sqlite>, filter: &'a RecordFilter) {
        if let Some(ids) = &filter.node_ids {
            if ids.is_empty() {
                qb.push(" AND 0");
            } else {
                qb.push(" AND source_node_id IN (");
                let mut sep = qb.separated(", ");
                for id in ids {
                    sep.push_bind(id.as_str());
                }
                sep.push_unseparated(")");
            }
        }
        if let Some(since) = filter.edited_since {
            qb.push(" AND source_last_edited_at >= ");
            qb.push_bind(since.timestamp_millis());
        }
    }
}

fn read_err(e: sqlx::Error) -> Error {
    Error::index_read(e.to_string())
}

fn write_err(e: sqlx::Error) -> Error {
    Error::index_write(e.to_string())
}

fn metadata_from_row(row: &SqliteRow) -> RecordMetadata {
    let edited_ms: i64 = row.get("source_last_edited_at");
    let sequence_index: i64 = row.get("sequence_index");
    RecordMetadata {
        source_node_id: row.get("source_node_id"),
        source_last_edited_at: DateTime::from_timestamp_millis(edited_ms).unwrap_or_default(),
        sequence_index: sequence_index as u32,
        content_hash: row.get("content_hash"),
        title: row.get("title"),
        url: row.get("url"),
    }
}

async fn upsert_one<'c, E>(executor: E, collection: &str, r: &VectorRecord) -> Result<()>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO vector_records (collection, chunk_id, source_node_id, sequence_index,
                                    source_last_edited_at, content_hash, title, url,
                                    text, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(collection, chunk_id) DO UPDATE SET
            source_node_id = excluded.source_node_id,
            sequence_index = excluded.sequence_index,
            source_last_edited_at = excluded.source_last_edited_at,
            content_hash = excluded.content_hash,
            title = excluded.title,
            url = excluded.url,
            text = excluded.text,
            embedding = excluded.embedding
        "#,
    )
    .bind(collection)
    .bind(&r.chunk_id)
    .bind(&r.metadata.source_node_id)
    .bind(r.metadata.sequence_index as i64)
    .bind(r.metadata.source_last_edited_at.timestamp_millis())
    .bind(&r.metadata.content_hash)
    .bind(&r.metadata.title)
    .bind(&r.metadata.url)
    .bind(&r.text)
    .bind(vec_to_blob(&r.embedding))
    .execute(executor)
    .await
    .map_err(write_err)?;
    Ok(())
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, records: &[VectorRecord]) -> Result<usize> {
        self.check_dimensions(records)?;
        let mut tx = self.pool.begin().await.map_err(write_err)?;
        for r in records {
            upsert_one(&mut *tx, &self.collection, r).await?;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(records.len())
    }

    async fn delete_by_id(&self, ids: &BTreeSet<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM vector_records WHERE collection = ");
        qb.push_bind(&self.collection);
        qb.push(" AND chunk_id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id.as_str());
        }
        sep.push_unseparated(")");
        let done = qb.build().execute(&self.pool).await.map_err(write_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn delete_by_filter(&self, filter: &RecordFilter) -> Result<usize> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("DELETE FROM vector_records WHERE collection = ");
        qb.push_bind(&self.collection);
        self.push_filter(&mut qb, filter);
        let done = qb.build().execute(&self.pool).await.map_err(write_err)?;
        Ok(done.rows_affected() as usize)
    }

    async fn list_ids(&self, filter: &RecordFilter) -> Result<Vec<String>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT chunk_id FROM vector_records WHERE collection = ");
        qb.push_bind(&self.collection);
        self.push_filter(&mut qb, filter);
        qb.push(" ORDER BY chunk_id");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(read_err)?;
        Ok(rows.iter().map(|r| r.get("chunk_id")).collect())
    }

    async fn list_node_ids(&self) -> Result<BTreeSet<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT source_node_id FROM vector_records WHERE collection = ?",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await
        .map_err(read_err)?;
        Ok(rows.iter().map(|r| r.get("source_node_id")).collect())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &RecordFilter,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(Error::EmbeddingDimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT chunk_id, source_node_id, sequence_index, source_last_edited_at, \
             content_hash, title, url, text, embedding \
             FROM vector_records WHERE collection = ",
        );
        qb.push_bind(&self.collection);
        self.push_filter(&mut qb, filter);
        let rows = qb.build().fetch_all(&self.pool).await.map_err(read_err)?;

        let hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                SearchHit {
                    chunk_id: row.get("chunk_id"),
                    score: cosine_similarity(query, &blob_to_vec(&blob)),
                    text: row.get("text"),
                    metadata: metadata_from_row(row),
                }
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_records WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await
            .map_err(read_err)?;
        Ok(n as usize)
    }

    /// Upserts and orphan removal for one node run in a single transaction.
    async fn replace_node(&self, node_id: &str, records: &[VectorRecord]) -> Result<ReplaceOutcome> {
        self.check_dimensions(records)?;
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT chunk_id FROM vector_records WHERE collection = ? AND source_node_id = ?",
        )
        .bind(&self.collection)
        .bind(node_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(write_err)?;

        for r in records {
            upsert_one(&mut *tx, &self.collection, r).await?;
        }

        let fresh: BTreeSet<&str> = records.iter().map(|r| r.chunk_id.as_str()).collect();
        let mut removed = 0;
        for orphan in existing.iter().filter(|id| !fresh.contains(id.as_str())) {
            sqlx::query("DELETE FROM vector_records WHERE collection = ? AND chunk_id = ?")
                .bind(&self.collection)
                .bind(orphan)
                .execute(&mut *tx)
                .await
                .map_err(write_err)?;
            removed += 1;
        }

        tx.commit().await.map_err(write_err)?;
        Ok(ReplaceOutcome {
            upserted: records.len(),
            removed,
        })
    }
}
