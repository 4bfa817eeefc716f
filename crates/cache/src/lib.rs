//! capibara_cache
//!
//! Content-addressed cache of generated scripts, keyed by fingerprint.
//!
//! Storage layout (cache root):
//!   {fingerprint}.json   one file per cached artifact
//!   metadata.json        index of all cached fingerprints, rewritten
//!                        canonically on every mutation
//!
//! Timestamps are unix seconds (`f64`), supplied by the caller rather than
//! read from the system clock here, so the store stays a pure function of
//! its inputs and is trivial to unit test.

use capibara_common::{canonical_json_bytes, CanonError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub script_id: String,
    pub fingerprint: String,
    pub prompt: String,
    pub language: String,
    pub code: String,
    pub policy_name: String,
    pub provider_used: String,
    pub created_at: f64,
    pub last_accessed_at: f64,
    pub access_count: u64,
    pub cache_hit_count: u64,
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaEntry {
    size_bytes: u64,
    created_at: f64,
    last_accessed_at: f64,
    access_count: u64,
    language: String,
    prompt_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    CreatedAt,
    LastAccessedAt,
    AccessCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_size_bytes: u64,
    pub entry_count: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
pub struct ClearCriteria {
    pub script_ids: Option<Vec<String>>,
    pub language: Option<String>,
    pub older_than_seconds: Option<u64>,
    pub all: bool,
}

/// Write `bytes` to `path` without ever exposing a partially-written
/// file to a concurrent reader: write to a sibling temp file, then
/// `rename` into place. Rename is atomic on one filesystem, so a reader
/// racing this write observes either the complete prior file or the
/// complete new one, never a torn read.
fn write_atomic(path: &Path, bytes: &[u8], seq: u64) -> Result<(), CacheError> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(format!(".tmp{seq}"));
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

pub struct Store {
    cache_dir: PathBuf,
    stats: Mutex<CacheStats>,
    /// Guards the metadata.json read-modify-write cycle so two
    /// concurrent `persist`/`evict` calls for different fingerprints
    /// can't race each other and drop an index entry.
    index_lock: Mutex<()>,
    tmp_seq: AtomicU64,
}

impl Store {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            stats: Mutex::new(CacheStats::default()),
            index_lock: Mutex::new(()),
            tmp_seq: AtomicU64::new(0),
        })
    }

    fn next_tmp_seq(&self) -> u64 {
        self.tmp_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    fn metadata_path(&self) -> PathBuf {
        self.cache_dir.join("metadata.json")
    }

    fn script_path(&self, fingerprint: &str) -> PathBuf {
        self.cache_dir.join(format!("{fingerprint}.json"))
    }

    fn load_metadata(&self) -> HashMap<String, MetaEntry> {
        let path = self.metadata_path();
        if !path.exists() {
            return HashMap::new();
        }
        fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn save_metadata(&self, meta: &HashMap<String, MetaEntry>) -> Result<(), CacheError> {
        let bytes = canonical_json_bytes(meta)?;
        write_atomic(&self.metadata_path(), &bytes, self.next_tmp_seq())?;
        Ok(())
    }

    /// Remove the on-disk artifact and its metadata entry. Idempotent.
    fn evict(&self, fingerprint: &str) -> Result<(), CacheError> {
        let path = self.script_path(fingerprint);
        if path.exists() {
            fs::remove_file(path)?;
        }
        let removed = {
            let _guard = self.index_lock.lock().unwrap();
            let mut meta = self.load_metadata();
            let entry = meta.remove(fingerprint);
            if entry.is_some() {
                self.save_metadata(&meta)?;
            }
            entry
        };
        if let Some(entry) = removed {
            let mut stats = self.stats.lock().unwrap();
            stats.total_size_bytes = stats.total_size_bytes.saturating_sub(entry.size_bytes);
            stats.evictions += 1;
        }
        Ok(())
    }

    /// Look up a cached artifact. Returns `None` on a miss, on an expired
    /// entry (evicted as a side effect), or on a corrupt read (also
    /// evicted, rather than merely reported as a miss).
    pub fn lookup(&self, fingerprint: &str, now: f64) -> Result<Option<Artifact>, CacheError> {
        let path = self.script_path(fingerprint);
        if !path.exists() {
            self.stats.lock().unwrap().misses += 1;
            return Ok(None);
        }

        let read = fs::read(&path).ok().and_then(|b| serde_json::from_slice::<Artifact>(&b).ok());
        let mut artifact = match read {
            Some(a) => a,
            None => {
                self.evict(fingerprint)?;
                self.stats.lock().unwrap().misses += 1;
                return Ok(None);
            }
        };

        if now - artifact.created_at > artifact.cache_ttl_seconds as f64 {
            self.evict(fingerprint)?;
            self.stats.lock().unwrap().misses += 1;
            return Ok(None);
        }

        artifact.last_accessed_at = now;
        self.persist(&artifact)?;
        self.stats.lock().unwrap().hits += 1;
        Ok(Some(artifact))
    }

    /// Persist an artifact (used both by `store` for new entries and by
    /// `lookup`/`record_hit` to update access bookkeeping in place).
    fn persist(&self, artifact: &Artifact) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec_pretty(artifact)?;
        let size_bytes = bytes.len() as u64;
        write_atomic(&self.script_path(&artifact.fingerprint), &bytes, self.next_tmp_seq())?;

        let prior = {
            let _guard = self.index_lock.lock().unwrap();
            let mut meta = self.load_metadata();
            let prior = meta.get(&artifact.fingerprint).map(|e| e.size_bytes).unwrap_or(0);
            meta.insert(
                artifact.fingerprint.clone(),
                MetaEntry {
                    size_bytes,
                    created_at: artifact.created_at,
                    last_accessed_at: artifact.last_accessed_at,
                    access_count: artifact.access_count,
                    language: artifact.language.clone(),
                    prompt_length: artifact.prompt.len() as u64,
                },
            );
            self.save_metadata(&meta)?;
            prior
        };

        let mut stats = self.stats.lock().unwrap();
        stats.total_size_bytes = stats.total_size_bytes.saturating_sub(prior) + size_bytes;
        Ok(())
    }

    /// Store a freshly generated artifact, stamping cache bookkeeping
    /// fields. `created_at`/`last_accessed_at` are set to `now`.
    pub fn store(&self, mut artifact: Artifact, now: f64) -> Result<Artifact, CacheError> {
        artifact.created_at = now;
        artifact.last_accessed_at = now;
        artifact.access_count = 0;
        artifact.cache_hit_count = 0;
        self.persist(&artifact)?;
        Ok(artifact)
    }

    /// Record a cache hit against an already-stored artifact: bumps
    /// `access_count` and `cache_hit_count`, refreshes `last_accessed_at`.
    /// Returns the post-increment `cache_hit_count`.
    pub fn record_hit(&self, fingerprint: &str, now: f64) -> Result<u64, CacheError> {
        let path = self.script_path(fingerprint);
        let Some(mut artifact) = fs::read(&path)
            .ok()
            .and_then(|b| serde_json::from_slice::<Artifact>(&b).ok())
        else {
            return Ok(0);
        };
        artifact.access_count += 1;
        artifact.cache_hit_count += 1;
        artifact.last_accessed_at = now;
        self.persist(&artifact)?;
        Ok(artifact.cache_hit_count)
    }

    pub fn list(
        &self,
        limit: usize,
        offset: usize,
        language: Option<&str>,
        search: Option<&str>,
        sort_by: SortBy,
        order: Order,
    ) -> Vec<Artifact> {
        let meta = self.load_metadata();
        let mut scripts: Vec<Artifact> = meta
            .keys()
            .filter_map(|fingerprint| {
                let path = self.script_path(fingerprint);
                let bytes = fs::read(&path).ok()?;
                serde_json::from_slice::<Artifact>(&bytes).ok()
            })
            .filter(|a| language.map(|l| a.language == l).unwrap_or(true))
            .filter(|a| {
                search
                    .map(|s| a.prompt.to_lowercase().contains(&s.to_lowercase()))
                    .unwrap_or(true)
            })
            .collect();

        scripts.sort_by(|a, b| {
            let ord = match sort_by {
                SortBy::CreatedAt => a.created_at.partial_cmp(&b.created_at).unwrap(),
                SortBy::LastAccessedAt => {
                    a.last_accessed_at.partial_cmp(&b.last_accessed_at).unwrap()
                }
                SortBy::AccessCount => a.access_count.cmp(&b.access_count),
            };
            if order == Order::Desc {
                ord.reverse()
            } else {
                ord
            }
        });

        scripts.into_iter().skip(offset).take(limit).collect()
    }

    /// Remove cached artifacts matching any of the given criteria.
    /// `all` takes precedence and clears everything. Returns the number
    /// of artifacts removed.
    pub fn clear(&self, criteria: &ClearCriteria, now: f64) -> Result<u64, CacheError> {
        let meta = self.load_metadata();
        let fingerprints: Vec<String> = if criteria.all {
            meta.keys().cloned().collect()
        } else {
            meta.iter()
                .filter(|(fingerprint, entry)| {
                    let by_language = criteria
                        .language
                        .as_ref()
                        .map(|l| &entry.language == l)
                        .unwrap_or(false);
                    let by_age = criteria
                        .older_than_seconds
                        .map(|secs| now - entry.created_at > secs as f64)
                        .unwrap_or(false);
                    let by_id = criteria
                        .script_ids
                        .as_ref()
                        .map(|ids| {
                            fs::read(self.script_path(fingerprint))
                                .ok()
                                .and_then(|b| serde_json::from_slice::<Artifact>(&b).ok())
                                .map(|a| ids.contains(&a.script_id))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false);
                    by_id || by_language || by_age
                })
                .map(|(fp, _)| fp.clone())
                .collect()
        };

        let mut cleared = 0u64;
        for fingerprint in &fingerprints {
            self.evict(fingerprint)?;
            cleared += 1;
        }
        Ok(cleared)
    }

    pub fn stats(&self) -> CacheStats {
        let stats = self.stats.lock().unwrap();
        let meta = self.load_metadata();
        let probes = stats.hits + stats.misses;
        let hit_rate = if probes > 0 { stats.hits as f64 / probes as f64 } else { 0.0 };
        CacheStats {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            total_size_bytes: meta.values().map(|e| e.size_bytes).sum(),
            entry_count: meta.len() as u64,
            hit_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in_tmp() -> (TempDir, Store) {
        let td = TempDir::new().unwrap();
        let store = Store::new(td.path().join("cache")).unwrap();
        (td, store)
    }

    fn sample(fingerprint: &str) -> Artifact {
        Artifact {
            script_id: format!("script_{fingerprint}"),
            fingerprint: fingerprint.to_string(),
            prompt: "read a csv file".into(),
            language: "python".into(),
            code: "print('hi')".into(),
            policy_name: "moderate".into(),
            provider_used: "openai".into(),
            created_at: 0.0,
            last_accessed_at: 0.0,
            access_count: 0,
            cache_hit_count: 0,
            cache_ttl_seconds: 3600,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 100.0).unwrap();
        let found = store.lookup("fp1", 200.0).unwrap().unwrap();
        assert_eq!(found.script_id, "script_fp1");
        assert_eq!(found.last_accessed_at, 200.0);
    }

    #[test]
    fn expired_entry_is_evicted_and_reported_as_miss() {
        let (_td, store) = store_in_tmp();
        let mut a = sample("fp1");
        a.cache_ttl_seconds = 10;
        store.store(a, 0.0).unwrap();
        let found = store.lookup("fp1", 1000.0).unwrap();
        assert!(found.is_none());
        assert!(!store.script_path("fp1").exists());
    }

    #[test]
    fn corrupt_entry_is_evicted() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 0.0).unwrap();
        fs::write(store.script_path("fp1"), b"not json").unwrap();
        let found = store.lookup("fp1", 1.0).unwrap();
        assert!(found.is_none());
        assert!(!store.script_path("fp1").exists());
    }

    #[test]
    fn list_filters_sorts_and_paginates() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 10.0).unwrap();
        store.store(sample("fp2"), 20.0).unwrap();
        let mut py3 = sample("fp3");
        py3.language = "bash".into();
        store.store(py3, 30.0).unwrap();

        let results = store.list(10, 0, Some("python"), None, SortBy::CreatedAt, Order::Desc);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].fingerprint, "fp2");
    }

    #[test]
    fn clear_all_removes_everything() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 0.0).unwrap();
        store.store(sample("fp2"), 0.0).unwrap();
        let n = store
            .clear(&ClearCriteria { all: true, ..Default::default() }, 1.0)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(store.stats().evictions, 2);
        assert_eq!(store.stats().entry_count, 0);
        assert!(store.lookup("fp1", 1.0).unwrap().is_none());
        assert!(store.lookup("fp2", 1.0).unwrap().is_none());
    }

    #[test]
    fn stats_track_entry_count_and_hit_rate() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 0.0).unwrap();
        store.store(sample("fp2"), 0.0).unwrap();
        assert_eq!(store.stats().entry_count, 2);
        assert_eq!(store.stats().hit_rate, 0.0);

        store.lookup("fp1", 1.0).unwrap();
        store.lookup("does-not-exist", 1.0).unwrap();
        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn record_hit_increments_monotonically() {
        let (_td, store) = store_in_tmp();
        store.store(sample("fp1"), 0.0).unwrap();
        assert_eq!(store.record_hit("fp1", 1.0).unwrap(), 1);
        assert_eq!(store.record_hit("fp1", 2.0).unwrap(), 2);
    }
}
