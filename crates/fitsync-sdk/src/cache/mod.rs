//! 持久化缓存
//!
//! 服务端数据的本地副本，写穿到 sled（`cache_entries` Tree），内存中维护：
//! - LRU 访问顺序（超出容量时淘汰最久未访问的条目，被 `CacheReadGuard` 固定的条目除外）
//! - 标签索引（`workout:42`、`workout` 等），按标签精确失效
//! - 命中 / 未命中 / 淘汰 / 过期 / 失效计数
//!
//! 过期条目立即视为不存在，在下一次写入或 `purge_expired` 时物理删除。

pub mod health;

pub use health::{CacheHealthReport, CacheHealthThresholds, HealthIssue, HealthStatus};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{FitsyncSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::storage::KvTree;
use crate::utils::{duration_ms, Clock};

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 总容量上限（字节）
    pub max_size_bytes: u64,
    /// 条目数上限
    pub max_entries: Option<usize>,
    /// 未指定 TTL 时的默认值
    pub default_ttl_ms: u64,
    pub health: CacheHealthThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            max_entries: None,
            default_ttl_ms: 24 * 60 * 60 * 1_000,
            health: CacheHealthThresholds::default(),
        }
    }
}

/// 缓存条目，整条覆盖写入
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub tags: BTreeSet<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub size_bytes: u64,
    pub last_accessed_at: i64,
}

impl CacheEntry {
    pub fn is_expired(&self, now: i64) -> bool {
        now > self.expires_at
    }

    fn compute_size(key: &str, value: &[u8], tags: &BTreeSet<String>) -> u64 {
        (key.len() + value.len() + tags.iter().map(String::len).sum::<usize>()) as u64
    }
}

/// 写入选项
#[derive(Debug, Clone, Default)]
pub struct CacheSetOptions {
    pub tags: Vec<String>,
    pub ttl: Option<Duration>,
}

impl CacheSetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// 缓存统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// 命中率；还没有请求时为 1.0
    pub hit_rate: f64,
    /// 最老的有效条目年龄
    pub oldest_item_age_ms: Option<i64>,
    /// 有效条目的总大小，不含尚未清理的过期条目
    pub total_size_bytes: u64,
    pub max_size_bytes: u64,
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

/// `maintain` 的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMaintenanceReport {
    pub expired_removed: usize,
    pub stale_removed: usize,
    pub health: CacheHealthReport,
}

#[derive(Debug, Default)]
struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// 访问序号 -> key，最小的最久未访问
    recency: BTreeMap<u64, String>,
    ticks: HashMap<String, u64>,
    next_tick: u64,
    tag_index: HashMap<String, HashSet<String>>,
    pins: HashMap<String, usize>,
    total_size: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(old) = self.ticks.insert(key.to_string(), tick) {
            self.recency.remove(&old);
        }
        self.recency.insert(tick, key.to_string());
    }

    fn insert(&mut self, entry: CacheEntry) {
        self.detach(&entry.key);
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(entry.key.clone());
        }
        self.total_size += entry.size_bytes;
        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry);
        self.touch(&key);
    }

    fn detach(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        if let Some(tick) = self.ticks.remove(key) {
            self.recency.remove(&tick);
        }
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        self.total_size = self.total_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pins.get(key).map_or(false, |n| *n > 0)
    }

    fn expired_keys(&self, now: i64) -> Vec<String> {
        self.entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect()
    }

    /// 为写入 `key`（`size` 字节）腾出空间需要淘汰的条目；固定的条目无法淘汰时返回 None
    fn lru_victims(&self, key: &str, size: u64, config: &CacheConfig) -> Option<Vec<String>> {
        let existing = self.entries.get(key);
        let mut total = self.total_size - existing.map_or(0, |e| e.size_bytes);
        let mut count = self.entries.len() - usize::from(existing.is_some());
        let over = |total: u64, count: usize| {
            total + size > config.max_size_bytes
                || config.max_entries.map_or(false, |max| count + 1 > max)
        };

        let mut victims = Vec::new();
        for candidate in self.recency.values() {
            if !over(total, count) {
                break;
            }
            if candidate == key || self.is_pinned(candidate) {
                continue;
            }
            if let Some(entry) = self.entries.get(candidate) {
                total -= entry.size_bytes;
                count -= 1;
                victims.push(candidate.clone());
            }
        }
        if over(total, count) {
            None
        } else {
            Some(victims)
        }
    }

    fn keys_for_tags<S: AsRef<str>>(&self, tags: &[S]) -> BTreeSet<String> {
        tags.iter()
            .filter_map(|t| self.tag_index.get(t.as_ref()))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }
}

/// 读取期间固定条目，guard 存活时该条目不会被 LRU 淘汰
pub struct CacheReadGuard<'a> {
    cache: &'a DurableCache,
    key: String,
    value: Vec<u8>,
}

impl CacheReadGuard<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

impl Drop for CacheReadGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.key);
    }
}

/// 持久化 LRU 缓存
pub struct DurableCache {
    tree: KvTree,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    state: Mutex<CacheState>,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for DurableCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl DurableCache {
    /// 从 sled 载入缓存；无法解码或已过期的条目直接删除
    pub fn open(
        tree: KvTree,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let now = clock.now_ms();
        let (mut loaded, corrupted) = tree.load_all::<CacheEntry>()?;

        let mut dropped: Vec<String> = corrupted;
        loaded.retain(|(key, entry)| {
            if entry.is_expired(now) {
                dropped.push(key.clone());
                false
            } else {
                true
            }
        });
        if !dropped.is_empty() {
            tree.remove_many(dropped.iter().map(String::as_str))?;
        }

        loaded.sort_by_key(|(_, e)| e.last_accessed_at);
        let mut state = CacheState::default();
        for (_, entry) in loaded {
            state.insert(entry);
        }

        let cache = Self {
            tree,
            config,
            clock,
            events,
            state: Mutex::new(state),
            metrics: CacheMetrics::default(),
        };
        cache.enforce_budget()?;

        let stats = cache.stats();
        info!(
            "✅ 缓存已加载: {} 条，{} 字节，丢弃 {} 条",
            stats.entry_count,
            stats.total_size_bytes,
            dropped.len()
        );
        Ok(cache)
    }

    /// 读取原始字节；过期条目视为未命中
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lookup(key, false))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 读取并固定条目
    pub fn read(&self, key: &str) -> Result<Option<CacheReadGuard<'_>>> {
        Ok(self.lookup(key, true).map(|value| CacheReadGuard {
            cache: self,
            key: key.to_string(),
            value,
        }))
    }

    fn lookup(&self, key: &str, pin: bool) -> Option<Vec<u8>> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let value = match state.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => entry.value.clone(),
            _ => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        state.touch(key);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_accessed_at = now;
        }
        if pin {
            *state.pins.entry(key.to_string()).or_insert(0) += 1;
        }
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    fn unpin(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(count) = state.pins.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(key);
            }
        }
    }

    /// 写入（整条替换已有条目）
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>, options: CacheSetOptions) -> Result<()> {
        if key.is_empty() {
            return Err(FitsyncSDKError::InvalidArgument("缓存 key 不能为空".into()));
        }
        let now = self.clock.now_ms();
        let value = value.into();
        let tags: BTreeSet<String> = options.tags.into_iter().collect();
        let ttl_ms = options
            .ttl
            .map(duration_ms)
            .unwrap_or_else(|| i64::try_from(self.config.default_ttl_ms).unwrap_or(i64::MAX));
        let size_bytes = CacheEntry::compute_size(key, &value, &tags);
        if size_bytes > self.config.max_size_bytes {
            return Err(FitsyncSDKError::InvalidArgument(format!(
                "缓存条目 {} 大小 {} 超过容量上限 {}",
                key, size_bytes, self.config.max_size_bytes
            )));
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            tags,
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
            size_bytes,
            last_accessed_at: now,
        };

        let mut state = self.state.lock();
        let expired = state.expired_keys(now);
        if !expired.is_empty() {
            self.tree.remove_many(expired.iter().map(String::as_str))?;
            for k in &expired {
                state.detach(k);
            }
            self.metrics
                .expirations
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
        }

        let victims = state.lru_victims(key, size_bytes, &self.config).ok_or_else(|| {
            FitsyncSDKError::InvalidOperation(format!("缓存空间被固定条目占满，无法写入 {}", key))
        })?;
        if !victims.is_empty() {
            self.tree.remove_many(victims.iter().map(String::as_str))?;
            for k in &victims {
                state.detach(k);
            }
            self.metrics
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
            debug!("LRU 淘汰 {} 条缓存: {:?}", victims.len(), victims);
        }

        self.tree.set(key, &entry)?;
        state.insert(entry);
        Ok(())
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, options: CacheSetOptions) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, options)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.entries.contains_key(key) {
            return Ok(false);
        }
        self.tree.remove(key)?;
        state.detach(key);
        Ok(true)
    }

    /// 删除带有任一标签的条目，返回删除数量。
    /// 固定中的条目同样删除，读者持有的是自己的副本。
    pub fn clear_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> Result<usize> {
        let now = self.clock.now_ms();
        let removed = {
            let mut state = self.state.lock();
            let keys = state.keys_for_tags(tags);
            if keys.is_empty() {
                return Ok(0);
            }
            self.tree.remove_many(keys.iter().map(String::as_str))?;
            for k in &keys {
                state.detach(k);
            }
            keys.len()
        };
        self.metrics
            .invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
        debug!("按标签失效缓存 {:?}: {} 条", tags, removed);
        self.events.emit(SDKEvent::CacheInvalidated {
            tags,
            removed,
            timestamp: now,
        });
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.tree.clear()?;
        let pins = std::mem::take(&mut state.pins);
        *state = CacheState {
            pins,
            ..Default::default()
        };
        info!("缓存已清空");
        Ok(())
    }

    /// 物理删除已过期条目
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        let expired = state.expired_keys(now);
        if expired.is_empty() {
            return Ok(0);
        }
        self.tree.remove_many(expired.iter().map(String::as_str))?;
        for k in &expired {
            state.detach(k);
        }
        self.metrics
            .expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        debug!("清理过期缓存 {} 条", expired.len());
        Ok(expired.len())
    }

    /// 是否存在未过期的条目
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .get(key)
            .map_or(false, |e| !e.is_expired(now))
    }

    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now_ms();
        let (entry_count, total_size_bytes, oldest) = {
            let state = self.state.lock();
            let live = state.entries.values().filter(|e| !e.is_expired(now));
            let mut count = 0;
            let mut size = 0;
            let mut oldest: Option<i64> = None;
            for entry in live {
                count += 1;
                size += entry.size_bytes;
                oldest = Some(oldest.map_or(entry.created_at, |o| o.min(entry.created_at)));
            }
            (count, size, oldest)
        };

        let hits = self.metrics.hits.load(Ordering::Relaxed);
        let misses = self.metrics.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hit_rate: if total == 0 {
                1.0
            } else {
                hits as f64 / total as f64
            },
            oldest_item_age_ms: oldest.map(|created| now - created),
            total_size_bytes,
            max_size_bytes: self.config.max_size_bytes,
            entry_count,
            hits,
            misses,
            evictions: self.metrics.evictions.load(Ordering::Relaxed),
            expirations: self.metrics.expirations.load(Ordering::Relaxed),
            invalidations: self.metrics.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn health(&self) -> CacheHealthReport {
        health::evaluate(&self.stats(), &self.config.health)
    }

    /// 定期维护：清理过期条目，有陈旧条目时提前淘汰
    pub fn maintain(&self) -> Result<CacheMaintenanceReport> {
        let expired_removed = self.purge_expired()?;
        let report = self.health();

        let mut stale_removed = 0;
        if report.has_stale_entries() {
            let cutoff = self.clock.now_ms() - self.config.health.max_item_age_ms;
            let mut state = self.state.lock();
            let stale: Vec<String> = state
                .entries
                .values()
                .filter(|e| e.created_at < cutoff && !state.is_pinned(&e.key))
                .map(|e| e.key.clone())
                .collect();
            if !stale.is_empty() {
                self.tree.remove_many(stale.iter().map(String::as_str))?;
                for k in &stale {
                    state.detach(k);
                }
                self.metrics
                    .evictions
                    .fetch_add(stale.len() as u64, Ordering::Relaxed);
            }
            stale_removed = stale.len();
        }

        match report.status {
            HealthStatus::Healthy => {}
            HealthStatus::Warning => warn!("缓存健康检查告警: {:?}", report.issues),
            HealthStatus::Critical => warn!("⚠️ 缓存健康检查严重: {:?}", report.issues),
        }

        Ok(CacheMaintenanceReport {
            expired_removed,
            stale_removed,
            health: self.health(),
        })
    }

    /// 配置收紧后重启时把缓存压回容量内
    fn enforce_budget(&self) -> Result<()> {
        let mut state = self.state.lock();
        let over = |s: &CacheState| {
            s.total_size > self.config.max_size_bytes
                || self.config.max_entries.map_or(false, |max| s.entries.len() > max)
        };
        let mut victims = Vec::new();
        let order: Vec<String> = state.recency.values().cloned().collect();
        for key in order {
            if !over(&*state) {
                break;
            }
            state.detach(&key);
            victims.push(key);
        }
        if !victims.is_empty() {
            self.tree.remove_many(victims.iter().map(String::as_str))?;
            self.metrics
                .evictions
                .fetch_add(victims.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }
}
