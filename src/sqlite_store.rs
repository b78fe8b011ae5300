//! SQLite-backed [`DocumentStore`] implementation.
//!
//! One database per knowledge base, in WAL mode. Every mutating method
//! runs inside a single transaction, so a failed refresh commit leaves
//! the previous documents and chunks intact.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use knowledge_sync_core::models::{ChunkRecord, DocumentRecord, VectorId};
use knowledge_sync_core::store::{Changeset, DocumentStore, StoreStats};

use crate::{db, migrate};

/// SQLite's default limit on bound parameters is 999; stay well below it.
const IN_CLAUSE_BATCH: usize = 500;

/// SQLite implementation of the [`DocumentStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open or create the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path)
            .await
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn meta(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Record `value` under `key`, or fail if a different value is there.
    pub async fn ensure_meta(&self, key: &str, value: &str) -> Result<()> {
        match self.meta(key).await? {
            Some(existing) if existing != value => bail!(
                "store belongs to {}='{}', refusing to open it as '{}'",
                key,
                existing,
                value
            ),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT INTO meta (key, value) VALUES (?, ?)")
                    .bind(key)
                    .bind(value)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn delete_document(tx: &mut Transaction<'_, Sqlite>, path: &str) -> Result<u64> {
    // Chunks go first so the cascade never depends on the pragma.
    sqlx::query("DELETE FROM chunks WHERE document_path = ?")
        .bind(path)
        .execute(&mut **tx)
        .await?;
    let result = sqlx::query("DELETE FROM documents WHERE path = ?")
        .bind(path)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected())
}

async fn write_document(
    tx: &mut Transaction<'_, Sqlite>,
    document: &DocumentRecord,
    chunks: &[ChunkRecord],
) -> Result<()> {
    delete_document(tx, &document.path).await?;

    sqlx::query(
        r#"
        INSERT INTO documents (path, content_hash, mtime, chunk_count, indexed_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&document.path)
    .bind(&document.content_hash)
    .bind(document.mtime)
    .bind(chunks.len() as i64)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut **tx)
    .await?;

    for chunk in chunks {
        if chunk.document_path != document.path {
            bail!(
                "chunk {} belongs to {}, not {}",
                chunk.id,
                chunk.document_path,
                document.path
            );
        }
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_path, chunk_index, text,
                                start_offset, end_offset, vector_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_path)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(chunk.start_offset)
        .bind(chunk.end_offset)
        .bind(chunk.vector_id as i64)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to insert chunk {} of {}", chunk.chunk_index, chunk.document_path))?;
    }

    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> ChunkRecord {
    ChunkRecord {
        id: row.get("id"),
        document_path: row.get("document_path"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        start_offset: row.get("start_offset"),
        end_offset: row.get("end_offset"),
        vector_id: row.get::<i64, _>("vector_id") as VectorId,
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert(&self, document: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_document(&mut tx, document, chunks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<Vec<VectorId>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT vector_id FROM chunks WHERE document_path = ? ORDER BY chunk_index")
                .bind(path)
                .fetch_all(&mut *tx)
                .await?;
        delete_document(&mut tx, path).await?;
        tx.commit().await?;
        Ok(ids.into_iter().map(|id| id as VectorId).collect())
    }

    async fn apply(&self, changeset: &Changeset) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for path in &changeset.removals {
            delete_document(&mut tx, path).await?;
        }
        for upsert in &changeset.upserts {
            write_document(&mut tx, &upsert.document, &upsert.chunks).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn snapshot_hashes(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT path, content_hash FROM documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("path"), row.get("content_hash")))
            .collect())
    }

    async fn vector_refs(&self) -> Result<Vec<(String, VectorId)>> {
        let rows = sqlx::query("SELECT document_path, vector_id FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get("document_path"),
                    row.get::<i64, _>("vector_id") as VectorId,
                )
            })
            .collect())
    }

    async fn chunks_for_vectors(&self, ids: &[VectorId]) -> Result<Vec<ChunkRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for batch in ids.chunks(IN_CLAUSE_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT id, document_path, chunk_index, text, start_offset, end_offset, vector_id \
                 FROM chunks WHERE vector_id IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql);
            for &id in batch {
                query = query.bind(id as i64);
            }
            let rows = query.fetch_all(&self.pool).await?;
            out.extend(rows.iter().map(row_to_chunk));
        }
        Ok(out)
    }

    async fn max_vector_id(&self) -> Result<Option<VectorId>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(vector_id) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(max.map(|id| id as VectorId))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            documents: documents as u64,
            chunks: chunks as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knowledge_sync_core::chunk::chunk_text;
    use knowledge_sync_core::store::DocumentUpsert;
    use tempfile::TempDir;

    fn document(path: &str, hash: &str, text: &str, first_vector: VectorId) -> DocumentUpsert {
        let chunks: Vec<ChunkRecord> = chunk_text(text, 12, 3)
            .iter()
            .enumerate()
            .map(|(i, tc)| ChunkRecord::from_text_chunk(path, tc, first_vector + i as u64))
            .collect();
        DocumentUpsert {
            document: DocumentRecord::new(path, hash, 1_700_000_000, &chunks),
            chunks,
        }
    }

    async fn open_store(dir: &TempDir) -> SqliteStore {
        SqliteStore::open(&dir.path().join("store.sqlite")).await.unwrap()
    }

    #[tokio::test]
    async fn upsert_then_read_back() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let doc = document("notes/a.md", "h1", "alpha beta gamma delta epsilon", 1);
        store.upsert(&doc.document, &doc.chunks).await.unwrap();

        assert_eq!(store.snapshot_hashes().await.unwrap()["notes/a.md"], "h1");
        let mut ids: Vec<VectorId> = store
            .vector_refs()
            .await
            .unwrap()
            .into_iter()
            .map(|(path, id)| {
                assert_eq!(path, "notes/a.md");
                id
            })
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, doc.chunks.iter().map(|c| c.vector_id).collect::<Vec<_>>());

        let mut loaded = store.chunks_for_vectors(&ids).await.unwrap();
        loaded.sort_by_key(|c| c.chunk_index);
        let texts: Vec<&str> = loaded.iter().map(|c| c.text.as_str()).collect();
        let expected: Vec<&str> = doc.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, expected);
    }

    #[tokio::test]
    async fn apply_rolls_back_on_conflict() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let a = document("a.txt", "h1", "alpha", 1);
        store.upsert(&a.document, &a.chunks).await.unwrap();

        // Removal of a.txt would succeed, but b.txt reuses vector 9 twice.
        let mut b = document("b.txt", "h2", "one two three four five six", 9);
        let dup = b.chunks[0].vector_id;
        b.chunks[1].vector_id = dup;
        let result = store
            .apply(&Changeset {
                removals: vec!["a.txt".into()],
                upserts: vec![b],
            })
            .await;
        assert!(result.is_err());

        let hashes = store.snapshot_hashes().await.unwrap();
        assert_eq!(hashes.len(), 1);
        assert_eq!(hashes["a.txt"], "h1");
    }

    #[tokio::test]
    async fn remove_returns_vector_ids_and_cascades() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir).await;
        let a = document("a.txt", "h1", "one two three four five six", 4);
        store.upsert(&a.document, &a.chunks).await.unwrap();

        let removed = store.remove("a.txt").await.unwrap();
        assert_eq!(removed.len(), a.chunks.len());
        assert_eq!(store.stats().await.unwrap(), StoreStats::default());
        assert_eq!(store.max_vector_id().await.unwrap(), None);
    }

    #[tokio::test]
    async fn reopen_preserves_rows_and_meta() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir).await;
            store.ensure_meta("cache_key", "/docs:m").await.unwrap();
            let a = document("a.txt", "h1", "alpha", 3);
            store.upsert(&a.document, &a.chunks).await.unwrap();
            store.close().await;
        }
        let store = open_store(&dir).await;
        assert_eq!(store.meta("cache_key").await.unwrap().as_deref(), Some("/docs:m"));
        assert!(store.ensure_meta("cache_key", "/other:m").await.is_err());
        assert_eq!(store.max_vector_id().await.unwrap(), Some(3));
        let hits = store.chunks_for_vectors(&[3, 99]).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
