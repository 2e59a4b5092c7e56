//! RocksDB-backed session store.
//!
//! Column families:
//! - `sessions`: Full session documents (JSON, LZ4 compressed)
//! - `metadata`: `SessionSummary` per session (bincode)
//!
//! Both are keyed by the 16 raw bytes of the session id and written in one
//! batch, so a listing never points at a missing document.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tablesync_core::SessionDocument;
use uuid::Uuid;

use super::{most_recent, SessionStore, SessionSummary, StoreError};

const CF_SESSIONS: &str = "sessions";
const CF_METADATA: &str = "metadata";

/// On-disk store settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// LRU block cache shared by both column families
    pub cache_bytes: usize,
    /// fsync every save
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tablesync_data"),
            cache_bytes: 16 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

impl StoreConfig {
    /// Small cache, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache_bytes: 1024 * 1024,
            sync_writes: false,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksSessionStore {
    /// Single-threaded handle behind a mutex so the store is `Sync`
    db: Mutex<DBWithThreadMode<SingleThreaded>>,
    config: StoreConfig,
}

impl RocksSessionStore {
    /// Open the store, creating the directory and column families on first use.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        // Saved sessions are few and small
        db_opts.set_max_open_files(32);
        db_opts.set_keep_log_file_num(2);

        let cache = Cache::new_lru_cache(config.cache_bytes);
        let families = [CF_SESSIONS, CF_METADATA]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, family_options(name, &cache)));

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, families)?;
        log::info!("Opened session store at {}", config.path.display());

        Ok(Self {
            db: Mutex::new(db),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn with_db<R>(
        &self,
        f: impl FnOnce(&DBWithThreadMode<SingleThreaded>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let db = self
            .db
            .lock()
            .map_err(|_| StoreError::DatabaseError("session store lock poisoned".into()))?;
        f(&db)
    }
}

fn family_options(name: &str, cache: &Cache) -> Options {
    let mut table = BlockBasedOptions::default();
    table.set_block_cache(cache);

    let mut opts = Options::default();
    opts.set_block_based_table_factory(&table);
    // Session values arrive LZ4 framed already; summaries are tiny
    let compression = if name == CF_SESSIONS {
        DBCompressionType::None
    } else {
        DBCompressionType::Lz4
    };
    opts.set_compression_type(compression);
    opts
}

fn cf<'a>(
    db: &'a DBWithThreadMode<SingleThreaded>,
    name: &str,
) -> Result<&'a rocksdb::ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::DatabaseError(format!("missing column family {name}")))
}

fn encode_summary(summary: &SessionSummary) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(summary, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_summary(bytes: &[u8]) -> Result<SessionSummary, StoreError> {
    let (summary, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(summary)
}

impl SessionStore for RocksSessionStore {
    fn save(&self, document: &SessionDocument, is_host: bool) -> Result<SessionSummary, StoreError> {
        let json = serde_json::to_vec(document)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);
        let summary = SessionSummary::of(document, is_host);
        let meta = encode_summary(&summary)?;

        self.with_db(|db| {
            let key = document.id.as_bytes().to_vec();
            let mut batch = WriteBatch::default();
            batch.put_cf(cf(db, CF_SESSIONS)?, &key, &compressed);
            batch.put_cf(cf(db, CF_METADATA)?, &key, &meta);

            let mut durability = WriteOptions::default();
            durability.set_sync(self.config.sync_writes);
            db.write_opt(batch, &durability)?;
            Ok(())
        })?;

        log::debug!(
            "Saved session {} ({} bytes, {} compressed)",
            document.id,
            json.len(),
            compressed.len()
        );
        Ok(summary)
    }

    fn load(&self, id: Uuid) -> Result<SessionDocument, StoreError> {
        let compressed = self.with_db(|db| Ok(db.get_cf(cf(db, CF_SESSIONS)?, id.as_bytes())?))?;
        let compressed = compressed.ok_or(StoreError::NotFound(id))?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>, StoreError> {
        let summaries = self.with_db(|db| {
            let mut summaries = Vec::new();
            for item in db.iterator_cf(cf(db, CF_METADATA)?, IteratorMode::Start) {
                let (_, value) = item?;
                match decode_summary(&value) {
                    Ok(summary) => summaries.push(summary),
                    Err(e) => log::warn!("Skipping unreadable session metadata: {e}"),
                }
            }
            Ok(summaries)
        })?;
        Ok(most_recent(summaries, limit))
    }

    fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.with_db(|db| {
            let mut batch = WriteBatch::default();
            batch.delete_cf(cf(db, CF_SESSIONS)?, id.as_bytes());
            batch.delete_cf(cf(db, CF_METADATA)?, id.as_bytes());
            db.write(batch)?;
            Ok(())
        })
    }
}
