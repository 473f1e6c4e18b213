// 🗄️ Cache - Content-addressed, TTL-bounded store for fetched artifacts
//
// Backed by SQLite (WAL) so concurrent writers for the same key resolve to
// last-writer-wins and a reader never sees half a payload.
//
// Rules:
// - An expired entry is a miss and gets evicted on the read that notices it
// - An unreadable or checksum-mismatched entry is a miss, never an error
// - A store file that cannot be opened degrades to "always miss"
// - A disabled cache only bypasses storage; callers run the same code

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;

// ============================================================================
// TTLs
// ============================================================================

/// Ground-motion grids are re-published rarely once final
pub fn grid_ttl() -> Duration {
    Duration::hours(24)
}

/// Airport registry snapshot
pub fn airports_ttl() -> Duration {
    Duration::hours(24)
}

/// Country metadata changes even less often
pub fn countries_ttl() -> Duration {
    Duration::days(7)
}

// ============================================================================
// CACHE KEY
// ============================================================================

/// Deterministic fingerprint of a request (source + parameters)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build a key from a source identifier and its parameters.
    ///
    /// Parameter order does not matter: `[("a","1"),("b","2")]` and
    /// `[("b","2"),("a","1")]` produce the same key.
    pub fn fingerprint(source: &str, params: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(&str, &str)> = params.to_vec();
        sorted.sort();

        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        for (name, value) in sorted {
            hasher.update(b"\n");
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }

        CacheKey(format!("{}:{:x}", source, hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn payload_checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

// ============================================================================
// CACHE STORE
// ============================================================================

pub struct CacheStore {
    /// Configured on/off switch
    enabled: bool,

    /// None when disabled or when the backing file could not be opened
    conn: Option<Mutex<Connection>>,
}

impl CacheStore {
    /// Open (or create) a cache file. Never fails: an unusable file yields a
    /// store that always misses.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!("Cache directory {:?} unavailable, caching off: {}", parent, e);
                    return CacheStore { enabled: true, conn: None };
                }
            }
        }

        let opened = Connection::open(path)
            .context("Failed to open cache database")
            .and_then(|conn| {
                setup_cache_schema(&conn)?;
                Ok(conn)
            });

        match opened {
            Ok(conn) => CacheStore {
                enabled: true,
                conn: Some(Mutex::new(conn)),
            },
            Err(e) => {
                warn!("Cache file {:?} unreadable, caching off for this run: {:#}", path, e);
                CacheStore { enabled: true, conn: None }
            }
        }
    }

    /// Volatile cache, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_cache_schema(&conn)?;
        Ok(CacheStore {
            enabled: true,
            conn: Some(Mutex::new(conn)),
        })
    }

    /// Every get misses, every put is a no-op
    pub fn disabled() -> Self {
        CacheStore { enabled: false, conn: None }
    }

    /// Build from configuration: disabled flag wins, then file, then memory
    pub fn from_settings(enabled: bool, path: Option<&Path>) -> Self {
        if !enabled {
            return CacheStore::disabled();
        }
        match path {
            Some(p) => CacheStore::open(p),
            None => CacheStore::open_in_memory().unwrap_or_else(|e| {
                warn!("In-memory cache unavailable: {:#}", e);
                CacheStore { enabled: true, conn: None }
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// True when entries can actually be stored
    pub fn is_available(&self) -> bool {
        self.conn.is_some()
    }

    /// Cached bytes for `key` if present and not expired
    pub fn get(&self, key: &CacheKey) -> Option<Vec<u8>> {
        self.get_at(key, Utc::now())
    }

    /// Same as [`CacheStore::get`] with an explicit clock
    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Vec<u8>> {
        let conn = self.conn.as_ref()?;
        let conn = match conn.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Cache lock poisoned, treating {} as a miss", key);
                return None;
            }
        };

        let row = conn
            .query_row(
                "SELECT payload, checksum, expires_at FROM cache_entries WHERE cache_key = ?1",
                params![key.as_str()],
                |row| {
                    let payload: Vec<u8> = row.get(0)?;
                    let checksum: String = row.get(1)?;
                    let expires_at: i64 = row.get(2)?;
                    Ok((payload, checksum, expires_at))
                },
            )
            .optional();

        let (payload, checksum, expires_at) = match row {
            Ok(Some(found)) => found,
            Ok(None) => {
                debug!("Cache miss for {}", key);
                return None;
            }
            Err(e) => {
                warn!("Unreadable cache entry {}, evicting: {}", key, e);
                evict(&conn, key);
                return None;
            }
        };

        if expires_at <= now.timestamp_millis() {
            debug!("Cache expired for {}", key);
            evict(&conn, key);
            return None;
        }

        if payload_checksum(&payload) != checksum {
            warn!("Corrupted cache entry {} (checksum mismatch), evicting", key);
            evict(&conn, key);
            return None;
        }

        debug!("Cache hit for {} ({} bytes)", key, payload.len());
        Some(payload)
    }

    /// Store `value` under `key` for `ttl`, replacing any earlier entry
    pub fn put(&self, key: &CacheKey, value: &[u8], ttl: Duration) -> Result<()> {
        self.put_at(key, value, ttl, Utc::now())
    }

    /// Same as [`CacheStore::put`] with an explicit clock
    pub fn put_at(&self, key: &CacheKey, value: &[u8], ttl: Duration, now: DateTime<Utc>) -> Result<()> {
        let conn = match self.conn.as_ref() {
            Some(conn) => conn,
            None => return Ok(()),
        };
        let conn = conn.lock().map_err(|_| anyhow!("Cache lock poisoned"))?;

        let expires_at = (now + ttl).timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO cache_entries (cache_key, payload, checksum, stored_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.as_str(),
                value,
                payload_checksum(value),
                now.to_rfc3339(),
                expires_at,
            ],
        )
        .with_context(|| format!("Failed to write cache entry {}", key))?;

        debug!("Cached {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Typed read for derived artifacts; undecodable payloads are misses
    pub fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let bytes = self.get(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Cached {} is not valid JSON for the requested type: {}", key, e);
                None
            }
        }
    }

    /// Typed write for derived artifacts
    pub fn put_json<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(value).context("Failed to serialize cache value")?;
        self.put(key, &bytes, ttl)
    }
}

fn evict(conn: &Connection, key: &CacheKey) {
    if let Err(e) = conn.execute(
        "DELETE FROM cache_entries WHERE cache_key = ?1",
        params![key.as_str()],
    ) {
        debug!("Could not evict {}: {}", key, e);
    }
}

pub fn setup_cache_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS cache_entries (
            cache_key TEXT PRIMARY KEY,
            payload BLOB NOT NULL,
            checksum TEXT NOT NULL,
            stored_at TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        )",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
