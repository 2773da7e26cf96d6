//! Directory-backed TTL cache.
//!
//! Each entry is one JSON file named by the SHA-256 of its key, so any user
//! text (Unicode, punctuation, arbitrary length) maps to a safe fixed-width
//! file name. Expiry is lazy: [`TtlCache::get`] drops a stale entry when it
//! finds one, and [`TtlCache::clear_expired`] sweeps the directory on demand.
//! There is no eviction beyond TTL.
//!
//! An entry created at `c` with TTL `T` is served while `now - c < T` and is
//! a miss from `now - c == T` onward.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KbError, KbResult};
use crate::storage::{read_json, remove_if_exists, write_json};

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry<V> {
    key: String,
    value: V,
    created_at: DateTime<Utc>,
    ttl_seconds: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        ttl_elapsed(self.created_at, self.ttl_seconds, now)
    }
}

/// True once `ttl_seconds` have passed since `created_at`. A TTL too large
/// for a `chrono::Duration` never elapses.
fn ttl_elapsed(created_at: DateTime<Utc>, ttl_seconds: u64, now: DateTime<Utc>) -> bool {
    match i64::try_from(ttl_seconds).ok().and_then(Duration::try_seconds) {
        Some(ttl) => now.signed_duration_since(created_at) >= ttl,
        None => false,
    }
}

/// Entry used when only the expiry header is needed.
#[derive(Deserialize)]
struct EntryHeader {
    created_at: DateTime<Utc>,
    ttl_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheInfo {
    pub total: usize,
    pub expired: usize,
    pub bytes: u64,
}

/// Fixed-width cache file stem for `key`.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct TtlCache<V> {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    _value: PhantomData<fn() -> V>,
}

impl<V: Serialize + DeserializeOwned> TtlCache<V> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(dir, Arc::new(SystemClock))
    }

    pub fn with_clock(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            clock,
            _value: PhantomData,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", hash_key(key)))
    }

    /// Store `value` under `key`. Write failures are logged and reported as
    /// `false`; a cache that cannot write never fails the caller.
    pub fn set(&self, key: &str, value: V, ttl_seconds: u64) -> bool {
        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: self.clock.now(),
            ttl_seconds,
        };
        match write_json(&self.entry_path(key), &entry) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "cache write failed");
                false
            }
        }
    }

    /// The stored value, or `None` when missing, expired, or unreadable.
    pub fn get(&self, key: &str) -> Option<V> {
        let path = self.entry_path(key);
        let entry: CacheEntry<V> = match read_json(&path) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unreadable cache entry");
                let _ = remove_if_exists(&path);
                return None;
            }
        };
        if entry.key != key {
            return None;
        }
        if entry.is_expired(self.clock.now()) {
            tracing::debug!(key = %hash_key(key), "cache entry expired");
            let _ = remove_if_exists(&path);
            return None;
        }
        Some(entry.value)
    }

    pub fn delete(&self, key: &str) -> KbResult<bool> {
        remove_if_exists(&self.entry_path(key))
    }

    fn entry_files(&self) -> KbResult<Vec<PathBuf>> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KbError::io(&self.dir, e)),
        };
        let mut files = Vec::new();
        for entry in read_dir {
            let path = entry.map_err(|e| KbError::io(&self.dir, e))?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn is_stale(&self, path: &Path, now: DateTime<Utc>) -> bool {
        match read_json::<EntryHeader>(path) {
            Ok(Some(h)) => ttl_elapsed(h.created_at, h.ttl_seconds, now),
            Ok(None) => false,
            Err(_) => true,
        }
    }

    /// Remove every expired or unreadable entry; returns how many went.
    pub fn clear_expired(&self) -> KbResult<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for path in self.entry_files()? {
            if self.is_stale(&path, now) && remove_if_exists(&path)? {
                removed += 1;
            }
        }
        tracing::info!(removed, dir = %self.dir.display(), "cleared expired cache entries");
        Ok(removed)
    }

    pub fn clear_all(&self) -> KbResult<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            if remove_if_exists(&path)? {
                removed += 1;
            }
        }
        tracing::info!(removed, dir = %self.dir.display(), "cleared cache");
        Ok(removed)
    }

    pub fn info(&self) -> KbResult<CacheInfo> {
        let now = self.clock.now();
        let mut info = CacheInfo::default();
        for path in self.entry_files()? {
            info.total += 1;
            info.bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if self.is_stale(&path, now) {
                info.expired += 1;
            }
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn cache_with_clock() -> (TempDir, Arc<ManualClock>, TtlCache<String>) {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let cache = TtlCache::with_clock(tmp.path().join("answers"), clock.clone());
        (tmp, clock, cache)
    }

    #[test]
    fn test_hash_key_is_fixed_width() {
        assert_eq!(hash_key("").len(), 64);
        assert_eq!(hash_key(&"長い質問".repeat(500)).len(), 64);
        assert_ne!(hash_key("a"), hash_key("b"));
    }

    #[test]
    fn test_value_returned_verbatim_before_ttl() {
        let (_tmp, clock, cache) = cache_with_clock();
        let value = "Paris ✓ \"quoted\"\nsecond line".to_string();
        assert!(cache.set("法国的首都?", value.clone(), 10));
        clock.advance(Duration::seconds(9));
        assert_eq!(cache.get("法国的首都?"), Some(value));
    }

    #[test]
    fn test_miss_exactly_at_ttl_and_entry_removed() {
        let (_tmp, clock, cache) = cache_with_clock();
        cache.set("k", "v".to_string(), 10);
        clock.advance(Duration::seconds(10));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.info().unwrap().total, 0);
    }

    #[test]
    fn test_zero_ttl_is_never_served() {
        let (_tmp, _clock, cache) = cache_with_clock();
        cache.set("k", "v".to_string(), 0);
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        let (_tmp, clock, cache) = cache_with_clock();
        cache.set("max", "a".to_string(), u64::MAX);
        cache.set("beyond-chrono", "b".to_string(), 10_000_000_000_000_000);
        clock.advance(Duration::days(365 * 100));

        assert_eq!(cache.get("max"), Some("a".to_string()));
        assert_eq!(cache.get("beyond-chrono"), Some("b".to_string()));
        assert_eq!(cache.info().unwrap().expired, 0);
        assert_eq!(cache.clear_expired().unwrap(), 0);
    }

    #[test]
    fn test_missing_key_is_none() {
        let (_tmp, _clock, cache) = cache_with_clock();
        assert_eq!(cache.get("nothing here"), None);
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let (_tmp, _clock, cache) = cache_with_clock();
        cache.set("k", "v".to_string(), 10);
        std::fs::write(cache.entry_path("k"), "{broken").unwrap();
        assert_eq!(cache.get("k"), None);
        assert!(!cache.entry_path("k").exists());
    }

    #[test]
    fn test_clear_expired_keeps_live_entries() {
        let (_tmp, clock, cache) = cache_with_clock();
        cache.set("short", "a".to_string(), 5);
        cache.set("long", "b".to_string(), 100);
        clock.advance(Duration::seconds(6));

        let info = cache.info().unwrap();
        assert_eq!((info.total, info.expired), (2, 1));
        assert!(info.bytes > 0);

        assert_eq!(cache.clear_expired().unwrap(), 1);
        assert_eq!(cache.get("long"), Some("b".to_string()));
    }

    #[test]
    fn test_delete_and_clear_all() {
        let (_tmp, _clock, cache) = cache_with_clock();
        cache.set("a", "1".to_string(), 60);
        cache.set("b", "2".to_string(), 60);
        cache.set("c", "3".to_string(), 60);
        assert!(cache.delete("a").unwrap());
        assert!(!cache.delete("a").unwrap());
        assert_eq!(cache.clear_all().unwrap(), 2);
        assert_eq!(cache.info().unwrap(), CacheInfo::default());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache: TtlCache<String> = TtlCache::new(tmp.path().join("never-created"));
        assert_eq!(cache.clear_expired().unwrap(), 0);
        assert_eq!(cache.info().unwrap().total, 0);
    }
}
