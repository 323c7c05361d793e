//! The three-layer cache store
//!
//! Layer order on read: local LRU, shared KV, file. The write layer is
//! selected by serialized size: payloads over the file threshold go to the
//! file layer only; smaller payloads go to the shared layer and, when under
//! a tenth of the local byte budget, to the local LRU as well.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use glob::Pattern;
use lru::LruCache;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheKind};
use super::CacheError;
use crate::domain_types::CacheByteBudget;

/// Cache layer configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub local_budget: CacheByteBudget,
    /// Serialized payloads above this size go to the file layer only
    pub file_threshold_bytes: usize,
    pub file_dir: PathBuf,
    pub compression_enabled: bool,
    pub sweep_interval: StdDuration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_budget: CacheByteBudget::default(),
            file_threshold_bytes: 256 * 1024,
            file_dir: PathBuf::from("cache"),
            compression_enabled: true,
            sweep_interval: StdDuration::from_secs(300),
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub file_writes: u64,
    pub file_reads: u64,
    pub local_entries: usize,
    pub local_bytes: usize,
    pub local_budget_bytes: usize,
    pub shared_entries: usize,
    pub file_entries: usize,
    pub file_bytes: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    file_writes: AtomicU64,
    file_reads: AtomicU64,
}

struct LocalLayer {
    lru: LruCache<String, CacheEntry>,
    bytes: usize,
}

impl LocalLayer {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.lru.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }
}

/// The multi-tier cache store
pub struct CacheStore {
    config: CacheConfig,
    local: Mutex<LocalLayer>,
    shared: DashMap<String, Vec<u8>>,
    counters: Counters,
    sweeper: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheStore {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            local: Mutex::new(LocalLayer {
                lru: LruCache::unbounded(),
                bytes: 0,
            }),
            shared: DashMap::new(),
            counters: Counters::default(),
            sweeper: AsyncMutex::new(None),
        }
    }

    fn full_key(kind: CacheKind, key: &str) -> String {
        format!("{}:{key}", kind.as_str())
    }

    fn file_path(&self, full_key: &str) -> PathBuf {
        let safe = URL_SAFE_NO_PAD.encode(full_key.as_bytes());
        self.config.file_dir.join(format!("{safe}.cache"))
    }

    fn key_from_file_name(path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let decoded = URL_SAFE_NO_PAD.decode(stem.as_bytes()).ok()?;
        String::from_utf8(decoded).ok()
    }

    fn hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Looks a value up, consulting local, shared, then file layers.
    ///
    /// Expired entries found on the way are removed eagerly. Internal errors
    /// degrade to a miss.
    pub async fn get(&self, key: &str, kind: CacheKind) -> Option<Value> {
        let full_key = Self::full_key(kind, key);
        let now = Utc::now();

        // Local layer.
        {
            let mut local = self.local.lock().ok()?;
            if let Some(entry) = local.lru.get_mut(&full_key) {
                if entry.is_expired(now) {
                    local.remove(&full_key);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    self.miss();
                    return None;
                }
                entry.touch();
                let value = entry.value.clone();
                self.hit();
                return Some(value);
            }
        }

        // Shared layer.
        if let Some(bytes) = self.shared.get(&full_key).map(|b| b.clone()) {
            match CacheEntry::decode(&bytes) {
                Ok(mut entry) if !entry.is_expired(now) => {
                    entry.touch();
                    if entry.size_bytes < self.config.local_budget.as_usize() / 10 {
                        self.add_to_local(full_key, entry.clone());
                    }
                    self.hit();
                    return Some(entry.value);
                }
                Ok(_) => {
                    self.shared.remove(&full_key);
                }
                Err(e) => {
                    warn!(key = %full_key, error = %e, "dropping undecodable shared entry");
                    self.shared.remove(&full_key);
                }
            }
        }

        // File layer.
        let path = self.file_path(&full_key);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match CacheEntry::decode(&bytes) {
                Ok(entry) if !entry.is_expired(now) => {
                    self.counters.file_reads.fetch_add(1, Ordering::Relaxed);
                    self.hit();
                    return Some(entry.value);
                }
                Ok(_) | Err(_) => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        self.miss();
        None
    }

    /// Stores a value. `ttl` of `None` uses the kind's default; the
    /// serialized size selects the layer.
    pub async fn set(
        &self,
        key: &str,
        value: Value,
        kind: CacheKind,
        ttl: Option<Duration>,
        dependencies: Vec<String>,
    ) -> Result<(), CacheError> {
        let full_key = Self::full_key(kind, key);
        let mut entry = CacheEntry::new(full_key.clone(), kind, value, ttl, dependencies);
        let bytes = entry.encode(self.config.compression_enabled)?;
        entry.size_bytes = bytes.len();

        if entry.size_bytes > self.config.file_threshold_bytes {
            tokio::fs::create_dir_all(&self.config.file_dir).await?;
            tokio::fs::write(self.file_path(&full_key), &bytes).await?;
            self.counters.file_writes.fetch_add(1, Ordering::Relaxed);
            debug!(key = %full_key, size = entry.size_bytes, "cached to file layer");
            return Ok(());
        }

        self.shared.insert(full_key.clone(), bytes);
        if entry.size_bytes < self.config.local_budget.as_usize() / 10 {
            self.add_to_local(full_key, entry);
        }
        Ok(())
    }

    fn add_to_local(&self, full_key: String, entry: CacheEntry) {
        let Ok(mut local) = self.local.lock() else {
            return;
        };
        local.remove(&full_key);

        let budget = self.config.local_budget.as_usize();
        while local.bytes + entry.size_bytes > budget && !local.lru.is_empty() {
            if let Some((_, evicted)) = local.lru.pop_lru() {
                local.bytes = local.bytes.saturating_sub(evicted.size_bytes);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        local.bytes += entry.size_bytes;
        local.lru.put(full_key, entry);
    }

    /// Removes a key from every layer, reporting whether anything was
    /// deleted
    pub async fn delete(&self, key: &str, kind: CacheKind) -> bool {
        let full_key = Self::full_key(kind, key);
        let mut deleted = false;

        if let Ok(mut local) = self.local.lock() {
            deleted |= local.remove(&full_key).is_some();
        }
        deleted |= self.shared.remove(&full_key).is_some();
        deleted |= tokio::fs::remove_file(self.file_path(&full_key)).await.is_ok();
        deleted
    }

    /// Invalidates entries whose namespaced key matches a glob pattern.
    /// With a kind the pattern is scoped to that namespace; without, it
    /// applies across all namespaces.
    pub async fn invalidate_pattern(
        &self,
        pattern: &str,
        kind: Option<CacheKind>,
    ) -> Result<usize, CacheError> {
        let scoped = match kind {
            Some(kind) => format!("{}:{pattern}", kind.as_str()),
            None => format!("*:{pattern}"),
        };
        let matcher = Pattern::new(&scoped).map_err(|_| CacheError::InvalidPattern {
            pattern: scoped.clone(),
        })?;
        let mut removed = 0;

        if let Ok(mut local) = self.local.lock() {
            let matching: Vec<String> = local
                .lru
                .iter()
                .filter(|(k, _)| matcher.matches(k))
                .map(|(k, _)| k.clone())
                .collect();
            for key in matching {
                local.remove(&key);
                removed += 1;
            }
        }

        let shared_matches: Vec<String> = self
            .shared
            .iter()
            .filter(|e| matcher.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in shared_matches {
            self.shared.remove(&key);
            removed += 1;
        }

        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.file_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                if let Some(key) = Self::key_from_file_name(&file.path()) {
                    if matcher.matches(&key) && tokio::fs::remove_file(file.path()).await.is_ok() {
                        removed += 1;
                    }
                }
            }
        }

        info!(pattern = %scoped, removed, "invalidated cache entries by pattern");
        Ok(removed)
    }

    /// Invalidates every entry declaring the given dependency tag
    pub async fn invalidate_dependency(&self, tag: &str) -> usize {
        let mut removed = 0;

        if let Ok(mut local) = self.local.lock() {
            let matching: Vec<String> = local
                .lru
                .iter()
                .filter(|(_, e)| e.dependencies.iter().any(|d| d == tag))
                .map(|(k, _)| k.clone())
                .collect();
            for key in matching {
                local.remove(&key);
                removed += 1;
            }
        }

        let shared_matches: Vec<String> = self
            .shared
            .iter()
            .filter(|e| {
                CacheEntry::decode(e.value())
                    .map(|entry| entry.dependencies.iter().any(|d| d == tag))
                    .unwrap_or(false)
            })
            .map(|e| e.key().clone())
            .collect();
        for key in shared_matches {
            self.shared.remove(&key);
            removed += 1;
        }

        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.file_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                let Ok(bytes) = tokio::fs::read(file.path()).await else {
                    continue;
                };
                let depends = CacheEntry::decode(&bytes)
                    .map(|entry| entry.dependencies.iter().any(|d| d == tag))
                    .unwrap_or(false);
                if depends && tokio::fs::remove_file(file.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }

        info!(tag, removed, "invalidated cache entries by dependency");
        removed
    }

    /// Removes expired entries from every layer, returning how many were
    /// swept
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut swept = 0;

        if let Ok(mut local) = self.local.lock() {
            let expired: Vec<String> = local
                .lru
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                local.remove(&key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                swept += 1;
            }
        }

        let expired_shared: Vec<String> = self
            .shared
            .iter()
            .filter(|e| {
                CacheEntry::decode(e.value())
                    .map(|entry| entry.is_expired(now))
                    .unwrap_or(true)
            })
            .map(|e| e.key().clone())
            .collect();
        for key in expired_shared {
            self.shared.remove(&key);
            swept += 1;
        }

        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.file_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                let Ok(bytes) = tokio::fs::read(file.path()).await else {
                    continue;
                };
                let expired = CacheEntry::decode(&bytes)
                    .map(|entry| entry.is_expired(now))
                    .unwrap_or(true);
                if expired && tokio::fs::remove_file(file.path()).await.is_ok() {
                    swept += 1;
                }
            }
        }

        if swept > 0 {
            debug!(swept, "swept expired cache entries");
        }
        swept
    }

    /// Starts the periodic expiry sweeper
    pub async fn start(self: &Arc<Self>) {
        let mut guard = self.sweeper.lock().await;
        if guard.is_some() {
            return;
        }
        let store = Arc::clone(self);
        let interval = self.config.sweep_interval;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.sweep_expired().await;
            }
        }));
        info!("cache sweeper started");
    }

    /// Stops the periodic expiry sweeper
    pub async fn stop(&self) {
        if let Some(task) = self.sweeper.lock().await.take() {
            task.abort();
        }
    }

    /// Point-in-time statistics across all layers
    pub async fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let (local_entries, local_bytes) = match self.local.lock() {
            Ok(local) => (local.lru.len(), local.bytes),
            Err(_) => (0, 0),
        };

        let mut file_entries = 0;
        let mut file_bytes = 0;
        if let Ok(mut dir) = tokio::fs::read_dir(&self.config.file_dir).await {
            while let Ok(Some(file)) = dir.next_entry().await {
                if let Ok(meta) = file.metadata().await {
                    file_entries += 1;
                    file_bytes += meta.len();
                }
            }
        }

        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            file_writes: self.counters.file_writes.load(Ordering::Relaxed),
            file_reads: self.counters.file_reads.load(Ordering::Relaxed),
            local_entries,
            local_bytes,
            local_budget_bytes: self.config.local_budget.as_usize(),
            shared_entries: self.shared.len(),
            file_entries,
            file_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with(dir: &Path, budget: usize, threshold: usize) -> CacheStore {
        CacheStore::new(CacheConfig {
            local_budget: CacheByteBudget::try_new(budget).unwrap(),
            file_threshold_bytes: threshold,
            file_dir: dir.to_path_buf(),
            compression_enabled: true,
            sweep_interval: StdDuration::from_secs(300),
        })
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set("k1", json!({"answer": 42}), CacheKind::LlmResponse, None, vec![])
            .await
            .unwrap();
        assert_eq!(
            store.get("k1", CacheKind::LlmResponse).await,
            Some(json!({"answer": 42}))
        );
        let stats = store.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn kinds_namespace_their_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set("k", json!("llm"), CacheKind::LlmResponse, None, vec![])
            .await
            .unwrap();
        assert!(store.get("k", CacheKind::ExtractedContent).await.is_none());
    }

    #[tokio::test]
    async fn expired_entries_miss_and_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set(
                "k",
                json!("v"),
                CacheKind::WorkflowState,
                Some(Duration::seconds(-1)),
                vec![],
            )
            .await
            .unwrap();
        assert!(store.get("k", CacheKind::WorkflowState).await.is_none());
        assert!(store.get("k", CacheKind::WorkflowState).await.is_none());
        let stats = store.stats().await;
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.local_entries, 0);
    }

    #[tokio::test]
    async fn large_payloads_go_to_the_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 64);
        let big = json!({ "text": "x".repeat(500) });
        store
            .set("big", big.clone(), CacheKind::PdfContent, None, vec![])
            .await
            .unwrap();

        let stats = store.stats().await;
        assert_eq!(stats.file_writes, 1);
        assert_eq!(stats.shared_entries, 0);
        assert_eq!(store.get("big", CacheKind::PdfContent).await, Some(big));
        assert_eq!(store.stats().await.file_reads, 1);
    }

    #[tokio::test]
    async fn local_lru_evicts_least_recently_used_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let budget = 4096;
        let store = store_with(dir.path(), budget, 256 * 1024);
        for i in 0..20 {
            let key = format!("k{i:02}");
            store
                .set(&key, json!({ "k": key }), CacheKind::LlmResponse, None, vec![])
                .await
                .unwrap();
        }
        let stats = store.stats().await;
        assert!(stats.local_bytes <= budget);
        assert!(stats.evictions >= 1);
        // The oldest entry was evicted first; the newest survives.
        let local = store.local.lock().unwrap();
        assert!(!local.lru.contains(&CacheStore::full_key(CacheKind::LlmResponse, "k00")));
        assert!(local.lru.contains(&CacheStore::full_key(CacheKind::LlmResponse, "k19")));
    }

    #[tokio::test]
    async fn pattern_invalidation_is_namespace_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set("llm_gpt-4_aaa", json!(1), CacheKind::LlmResponse, None, vec![])
            .await
            .unwrap();
        store
            .set("llm_gpt-4_bbb", json!(2), CacheKind::LlmResponse, None, vec![])
            .await
            .unwrap();
        store
            .set("llm_gpt-4_ccc", json!(3), CacheKind::ExtractedContent, None, vec![])
            .await
            .unwrap();

        let removed = store
            .invalidate_pattern("llm_gpt-4_*", Some(CacheKind::LlmResponse))
            .await
            .unwrap();
        // Each entry lives in both the shared and local layers.
        assert_eq!(removed, 4);
        assert!(store.get("llm_gpt-4_aaa", CacheKind::LlmResponse).await.is_none());
        assert!(store.get("llm_gpt-4_ccc", CacheKind::ExtractedContent).await.is_some());
    }

    #[tokio::test]
    async fn dependency_invalidation_evicts_tagged_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set(
                "page1",
                json!(1),
                CacheKind::ExtractedContent,
                None,
                vec!["site:example.gov".to_string()],
            )
            .await
            .unwrap();
        store
            .set("page2", json!(2), CacheKind::ExtractedContent, None, vec![])
            .await
            .unwrap();

        let removed = store.invalidate_dependency("site:example.gov").await;
        assert!(removed >= 1);
        assert!(store.get("page1", CacheKind::ExtractedContent).await.is_none());
        assert!(store.get("page2", CacheKind::ExtractedContent).await.is_some());
    }

    #[tokio::test]
    async fn sweeper_removes_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with(dir.path(), 1 << 20, 256 * 1024);
        store
            .set(
                "stale",
                json!(1),
                CacheKind::ValidationResult,
                Some(Duration::seconds(-5)),
                vec![],
            )
            .await
            .unwrap();
        store
            .set("fresh", json!(2), CacheKind::ValidationResult, None, vec![])
            .await
            .unwrap();

        let swept = store.sweep_expired().await;
        assert!(swept >= 1);
        assert!(store.get("fresh", CacheKind::ValidationResult).await.is_some());
    }
}
