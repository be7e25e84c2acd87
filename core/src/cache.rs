/// Local key-value cache for cold-start fallback
/// Stores JSON values under string keys; never authoritative once a live fetch succeeds
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cache backed by sled embedded database
#[derive(Clone)]
pub struct LocalCache {
    db: Arc<sled::Db>,
}

impl LocalCache {
    /// Open (or create) the cache in the given data directory
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db_path = data_dir.join("chatsync-cache.db");
        debug!("Opening local cache at {:?}", db_path);

        let db = sled::open(&db_path)?;

        info!("Local cache initialized at {:?}", db_path);
        Ok(Self { db: Arc::new(db) })
    }

    /// Throwaway cache removed when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Undecodable entries are dropped and reported as missing
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        match serde_json::from_slice::<T>(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Discarding unreadable cache entry {}: {}", key, e);
                self.db.remove(key.as_bytes())?;
                Ok(None)
            }
        }
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    /// Delete every key under a prefix, returning how many were removed
    pub fn clear_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry?;
            self.db.remove(key)?;
            removed += 1;
        }
        Ok(removed)
    }
}
