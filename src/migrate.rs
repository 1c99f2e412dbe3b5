use anyhow::Result;
use sqlx::SqlitePool;

/// Create the collection registry, vector record and kv tables.
///
/// Every statement is idempotent, so this runs on each startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per collection: its fixed dimension and the model that set it
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dimension INTEGER NOT NULL,
            model TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_records (
            collection TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            source_node_id TEXT NOT NULL,
            sequence_index INTEGER NOT NULL,
            source_last_edited_at INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            title TEXT,
            url TEXT,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            PRIMARY KEY (collection, chunk_id),
            FOREIGN KEY (collection) REFERENCES collections(name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kv_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_node ON vector_records(collection, source_node_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_edited ON vector_records(collection, source_last_edited_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
