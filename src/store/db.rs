//! SQLite persistence layer for the chunk store

use super::models::{ChunkedMeta, ItemMeta};
use anyhow::{anyhow, Context, Result};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::schema::store_chunks::{self, dsl as chunks_dsl};
use super::schema::store_items::{self, dsl as items_dsl};
use super::schema::store_meta::dsl as meta_dsl;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/store");

/// SQLite-backed key/value + blob database with Diesel-managed schema.
pub struct StoreDb {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl StoreDb {
    /// Open the database at a specific path, creating parent directories and
    /// migrating the schema as needed.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create store parent dir {}", parent.display())
            })?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid store database path"))?;
        Self::with_url(&database_url)
    }

    /// Open an in-memory database; every connection sees the same data only
    /// while the single pooled connection lives, so the pool is capped at 1.
    pub fn in_memory() -> Result<Self> {
        Self::with_url(":memory:")
    }

    fn with_url(database_url: &str) -> Result<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build store connection pool")?;

        {
            let mut conn = pool.get().context("Failed to get store connection")?;
            conn.run_pending_migrations(MIGRATIONS)
                .map_err(|err| anyhow!("Failed to run store migrations: {err}"))?;
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from store pool")
    }

    /// Insert or replace an inline (non-chunked) value.
    pub fn put_inline(&self, key: &str, value: &[u8], now: i64) -> Result<()> {
        let mut conn = self.connection()?;
        conn.transaction::<(), diesel::result::Error, _>(|tx| {
            diesel::delete(chunks_dsl::store_chunks.filter(chunks_dsl::item_key.eq(key)))
                .execute(tx)?;
            diesel::delete(items_dsl::store_items.filter(items_dsl::key.eq(key))).execute(tx)?;
            diesel::insert_into(store_items::table)
                .values(NewItemRow::inline(key, value, now))
                .execute(tx)?;
            Ok(())
        })
        .context("Failed to save store item")
    }

    /// Insert or replace a chunked value. The primary row and every chunk row
    /// are written in one transaction so readers never observe a partial set.
    pub fn put_chunked(
        &self,
        key: &str,
        total_size: u64,
        chunk_size: u64,
        chunks: &[&[u8]],
        now: i64,
    ) -> Result<()> {
        let mut conn = self.connection()?;
        conn.transaction::<(), diesel::result::Error, _>(|tx| {
            diesel::delete(chunks_dsl::store_chunks.filter(chunks_dsl::item_key.eq(key)))
                .execute(tx)?;
            diesel::delete(items_dsl::store_items.filter(items_dsl::key.eq(key))).execute(tx)?;
            diesel::insert_into(store_items::table)
                .values(NewItemRow::chunked(
                    key,
                    total_size,
                    chunks.len() as i32,
                    chunk_size,
                    now,
                ))
                .execute(tx)?;
            for (seq, chunk) in chunks.iter().enumerate() {
                diesel::insert_into(store_chunks::table)
                    .values((
                        chunks_dsl::item_key.eq(key),
                        chunks_dsl::seq.eq(seq as i32),
                        chunks_dsl::data.eq(*chunk),
                    ))
                    .execute(tx)?;
            }
            Ok(())
        })
        .context("Failed to save chunked store item")
    }

    pub fn get_item(&self, key: &str) -> Result<Option<ItemRow>> {
        let mut conn = self.connection()?;
        items_dsl::store_items
            .filter(items_dsl::key.eq(key))
            .first::<ItemRow>(&mut conn)
            .optional()
            .context("Failed to query store item")
    }

    /// Chunk payloads for a key, ordered by sequence.
    pub fn get_chunks(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let mut conn = self.connection()?;
        let rows: Vec<(i32, Vec<u8>)> = chunks_dsl::store_chunks
            .filter(chunks_dsl::item_key.eq(key))
            .order(chunks_dsl::seq.asc())
            .select((chunks_dsl::seq, chunks_dsl::data))
            .load(&mut conn)
            .context("Failed to query store chunks")?;
        Ok(rows.into_iter().map(|(_, data)| data).collect())
    }

    pub fn delete_item(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = conn
            .transaction::<usize, diesel::result::Error, _>(|tx| {
                diesel::delete(chunks_dsl::store_chunks.filter(chunks_dsl::item_key.eq(key)))
                    .execute(tx)?;
                diesel::delete(items_dsl::store_items.filter(items_dsl::key.eq(key))).execute(tx)
            })
            .context("Failed to delete store item")?;
        Ok(affected > 0)
    }

    pub fn clear(&self) -> Result<()> {
        let mut conn = self.connection()?;
        conn.transaction::<(), diesel::result::Error, _>(|tx| {
            diesel::delete(store_chunks::table).execute(tx)?;
            diesel::delete(store_items::table).execute(tx)?;
            Ok(())
        })
        .context("Failed to clear store")
    }

    /// Bump access metadata. Callers treat failures as non-fatal.
    pub fn touch(&self, key: &str, now: i64) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(items_dsl::store_items.filter(items_dsl::key.eq(key)))
            .set((
                items_dsl::last_accessed.eq(now),
                items_dsl::access_count.eq(items_dsl::access_count + 1),
            ))
            .execute(&mut conn)
            .context("Failed to update access metadata")?;
        Ok(())
    }

    pub fn set_expiry(&self, key: &str, expire_at: i64) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(items_dsl::store_items.filter(items_dsl::key.eq(key)))
            .set(items_dsl::expire_at.eq(Some(expire_at)))
            .execute(&mut conn)
            .context("Failed to set item expiry")?;
        Ok(affected > 0)
    }

    pub fn set_priority(&self, key: &str, priority: i32) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(items_dsl::store_items.filter(items_dsl::key.eq(key)))
            .set(items_dsl::priority.eq(priority))
            .execute(&mut conn)
            .context("Failed to set item priority")?;
        Ok(affected > 0)
    }

    /// Metadata for every item, payloads excluded.
    pub fn list_meta(&self) -> Result<Vec<ItemMeta>> {
        let mut conn = self.connection()?;
        let rows: Vec<MetaRow> = items_dsl::store_items
            .select((
                items_dsl::key,
                items_dsl::size,
                items_dsl::created_at,
                items_dsl::last_modified,
                items_dsl::last_accessed,
                items_dsl::access_count,
                items_dsl::priority,
                items_dsl::expire_at,
                items_dsl::is_chunked,
                items_dsl::total_chunks,
                items_dsl::chunk_size,
            ))
            .load(&mut conn)
            .context("Failed to list store metadata")?;
        Ok(rows.into_iter().map(ItemMeta::from).collect())
    }

    /// Current usage as `(total_bytes, item_count)`.
    pub fn usage(&self) -> Result<(u64, u64)> {
        let mut conn = self.connection()?;
        let total: Option<i64> = items_dsl::store_items
            .select(diesel::dsl::sql::<diesel::sql_types::Nullable<diesel::sql_types::BigInt>>(
                "CAST(SUM(size) AS BIGINT)",
            ))
            .first(&mut conn)
            .context("Failed to sum store usage")?;
        let count: i64 = items_dsl::store_items
            .count()
            .get_result(&mut conn)
            .context("Failed to count store items")?;
        Ok((total.unwrap_or(0).max(0) as u64, count.max(0) as u64))
    }

    pub fn last_cleanup_at(&self) -> Result<i64> {
        let mut conn = self.connection()?;
        meta_dsl::store_meta
            .filter(meta_dsl::id.eq(1))
            .select(meta_dsl::last_cleanup_at)
            .first(&mut conn)
            .context("Failed to read store metadata")
    }

    /// Drop a single chunk row, leaving the primary row's advertised count
    /// intact. Test hook for exercising the short-read path.
    #[cfg(test)]
    pub fn delete_chunk_row(&self, key: &str, seq: i32) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(
            chunks_dsl::store_chunks
                .filter(chunks_dsl::item_key.eq(key))
                .filter(chunks_dsl::seq.eq(seq)),
        )
        .execute(&mut conn)
        .context("Failed to delete chunk row")?;
        Ok(())
    }

    pub fn record_cleanup(&self, now: i64) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::update(meta_dsl::store_meta.filter(meta_dsl::id.eq(1)))
            .set(meta_dsl::last_cleanup_at.eq(now))
            .execute(&mut conn)
            .context("Failed to record cleanup time")?;
        Ok(())
    }
}

#[derive(Queryable)]
pub struct ItemRow {
    pub key: String,
    pub size: i64,
    pub created_at: i64,
    pub last_modified: i64,
    pub last_accessed: i64,
    pub access_count: i64,
    pub priority: i32,
    pub expire_at: Option<i64>,
    pub is_chunked: bool,
    pub total_chunks: Option<i32>,
    pub chunk_size: Option<i64>,
    pub payload: Option<Vec<u8>>,
}

#[derive(Queryable)]
struct MetaRow {
    key: String,
    size: i64,
    created_at: i64,
    last_modified: i64,
    last_accessed: i64,
    access_count: i64,
    priority: i32,
    expire_at: Option<i64>,
    is_chunked: bool,
    total_chunks: Option<i32>,
    chunk_size: Option<i64>,
}

impl From<MetaRow> for ItemMeta {
    fn from(row: MetaRow) -> Self {
        let chunked = if row.is_chunked {
            Some(ChunkedMeta {
                total_chunks: row.total_chunks.unwrap_or(0).max(0) as u32,
                chunk_size: row.chunk_size.unwrap_or(0).max(0) as u64,
            })
        } else {
            None
        };
        ItemMeta {
            key: row.key,
            size: row.size.max(0) as u64,
            created_at: row.created_at,
            last_modified: row.last_modified,
            last_accessed: row.last_accessed,
            access_count: row.access_count,
            priority: row.priority,
            expire_at: row.expire_at,
            chunked,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = store_items)]
struct NewItemRow<'a> {
    key: &'a str,
    size: i64,
    created_at: i64,
    last_modified: i64,
    last_accessed: i64,
    access_count: i64,
    priority: i32,
    expire_at: Option<i64>,
    is_chunked: bool,
    total_chunks: Option<i32>,
    chunk_size: Option<i64>,
    payload: Option<&'a [u8]>,
}

impl<'a> NewItemRow<'a> {
    fn inline(key: &'a str, value: &'a [u8], now: i64) -> Self {
        Self {
            key,
            size: value.len() as i64,
            created_at: now,
            last_modified: now,
            last_accessed: now,
            access_count: 0,
            priority: 0,
            expire_at: None,
            is_chunked: false,
            total_chunks: None,
            chunk_size: None,
            payload: Some(value),
        }
    }

    fn chunked(key: &'a str, total_size: u64, total_chunks: i32, chunk_size: u64, now: i64) -> Self {
        Self {
            key,
            size: total_size as i64,
            created_at: now,
            last_modified: now,
            last_accessed: now,
            access_count: 0,
            priority: 0,
            expire_at: None,
            is_chunked: true,
            total_chunks: Some(total_chunks),
            chunk_size: Some(chunk_size as i64),
            payload: None,
        }
    }
}
