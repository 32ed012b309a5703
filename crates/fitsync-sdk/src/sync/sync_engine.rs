//! 同步引擎
//!
//! 每一轮：`Idle -> Draining -> Transmitting -> {Reconciling | Idle}`
//!
//! 1. 网络门禁放行后从队列认领一批操作
//! 2. 逐个发送到远端（带按优先级的超时）
//! 3. 接受：标记完成并按标签失效缓存；拒绝：永久失败；冲突：登记并等待解决；
//!    传输错误：退避重试
//!
//! 同一实体在本批次内一旦失败或冲突，后续操作放回队列，保证实体内顺序。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use super::conflict::{ConflictResolution, ConflictResolver, ConflictStrategy, ResolutionPlan, SyncConflict};
use super::remote::{ApplyOutcome, FetchFilter, RemoteStore};
use crate::cache::{CacheSetOptions, DurableCache};
use crate::error::{FitsyncSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::network::{NetworkMonitor, SyncGate};
use crate::storage::queue::{
    EntityKey, OperationQueue, OperationStatus, QueuedOperation, SyncFailureReason,
};
use crate::utils::Clock;

/// 实体在缓存中的 key
pub fn entity_cache_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

/// 单条实体记录的标签，只有 `{type}:{id}`
///
/// 裸的 `{type}` 标签留给列表、汇总这类集合缓存，不打在单条记录上
pub fn entity_tags(entity_type: &str, entity_id: &str) -> Vec<String> {
    vec![entity_cache_key(entity_type, entity_id)]
}

/// 实体变更后要失效的标签：该实体本身，加上同类型的集合缓存
pub fn invalidation_tags(entity_type: &str, entity_id: &str) -> Vec<String> {
    vec![
        entity_cache_key(entity_type, entity_id),
        entity_type.to_string(),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Draining,
    Transmitting,
    Reconciling,
}

/// 同步引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEngineConfig {
    /// 每批认领的操作数
    pub batch_size: usize,
    /// 每轮最多处理的批次数
    pub max_batches_per_cycle: usize,
    /// 单次传输超时；None 表示按操作优先级取值
    pub transmit_timeout_ms: Option<u64>,
    /// 拉取超时
    pub fetch_timeout_ms: u64,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_batches_per_cycle: 10,
            transmit_timeout_ms: None,
            fetch_timeout_ms: 30_000,
        }
    }
}

/// 一轮同步的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncCycleReport {
    pub started_at: i64,
    pub finished_at: i64,
    /// 未执行时的原因
    pub skipped: Option<String>,
    /// 推断离线状态下的探测轮
    pub probe: bool,
    pub transmitted: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub conflicts: usize,
    pub auto_resolved: usize,
    pub failed: usize,
    /// 因同一实体前序操作受阻而放回队列的数量
    pub released: usize,
}

impl SyncCycleReport {
    fn skipped(now: i64, reason: impl Into<String>) -> Self {
        Self {
            started_at: now,
            finished_at: now,
            skipped: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// `resolve_conflict` 的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveOutcome {
    pub conflict_id: String,
    pub operation_id: String,
    pub resolution: ConflictResolution,
    pub record: Option<Value>,
    pub resolved_at: Option<i64>,
    /// 冲突此前已解决，本次直接返回已保存的结果
    pub already_resolved: bool,
    /// 操作当前状态；采用远端版本时操作已移除
    pub operation_status: Option<OperationStatus>,
}

enum Settled {
    Done,
    Rejected,
    Failed,
    Conflict(SyncConflict),
}

/// 同步引擎
pub struct SyncEngine {
    queue: Arc<OperationQueue>,
    cache: Arc<DurableCache>,
    conflicts: Arc<ConflictResolver>,
    remote: Arc<dyn RemoteStore>,
    network: Arc<NetworkMonitor>,
    config: SyncEngineConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    cycle_lock: tokio::sync::Mutex<()>,
    resolve_lock: tokio::sync::Mutex<()>,
    phase: Mutex<SyncPhase>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OperationQueue>,
        cache: Arc<DurableCache>,
        conflicts: Arc<ConflictResolver>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
        config: SyncEngineConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Self {
        Self {
            queue,
            cache,
            conflicts,
            remote,
            network,
            config,
            clock,
            events,
            cycle_lock: tokio::sync::Mutex::new(()),
            resolve_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: SyncPhase) {
        *self.phase.lock() = phase;
    }

    /// 执行一轮同步；同一时间最多一轮在进行
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<SyncCycleReport> {
        let now = self.clock.now_ms();
        let Ok(_cycle) = self.cycle_lock.try_lock() else {
            debug!("上一轮同步仍在进行，跳过");
            return Ok(SyncCycleReport::skipped(now, "busy"));
        };

        let gate = self.network.sync_gate();
        let probe = match gate {
            SyncGate::Allowed => false,
            SyncGate::Probe => {
                self.network.mark_probe();
                true
            }
            SyncGate::Unstable { until } => {
                debug!("网络刚恢复，等待稳定窗口结束 ({}ms)", until - now);
                return Ok(SyncCycleReport::skipped(now, "unstable"));
            }
            SyncGate::Offline => return Ok(SyncCycleReport::skipped(now, "offline")),
        };

        let mut report = SyncCycleReport {
            started_at: now,
            probe,
            ..Default::default()
        };
        let (batches, batch_size) = if probe {
            (1, 1)
        } else {
            (self.config.max_batches_per_cycle.max(1), self.config.batch_size.max(1))
        };

        for _ in 0..batches {
            self.set_phase(SyncPhase::Draining);
            let batch = match self.queue.dequeue_batch(batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    self.storage_failure(None, &e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            self.set_phase(SyncPhase::Transmitting);
            let interrupted = self.transmit_batch(batch, &mut report).await;
            if interrupted || probe {
                break;
            }
        }

        self.set_phase(SyncPhase::Idle);
        report.finished_at = self.clock.now_ms();
        if report.transmitted > 0 {
            info!(
                "同步完成: 发送 {}，接受 {}，拒绝 {}，冲突 {}，失败 {}",
                report.transmitted, report.accepted, report.rejected, report.conflicts, report.failed
            );
        }
        self.events.emit(SDKEvent::SyncCycleFinished {
            report: report.clone(),
            timestamp: report.finished_at,
        });
        Ok(report)
    }

    /// 发送一批操作，返回是否因网络中断提前结束
    async fn transmit_batch(&self, batch: Vec<QueuedOperation>, report: &mut SyncCycleReport) -> bool {
        let mut blocked: HashSet<EntityKey> = HashSet::new();
        let mut remaining = batch.into_iter();

        while let Some(op) = remaining.next() {
            let key = op.entity_key();
            if blocked.contains(&key) {
                self.release(&op, report);
                continue;
            }

            report.transmitted += 1;
            let outcome = self.transmit(&op).await;
            match self.settle(&op, outcome) {
                Settled::Done => report.accepted += 1,
                Settled::Rejected => {
                    blocked.insert(key);
                    report.rejected += 1;
                }
                Settled::Failed => {
                    blocked.insert(key);
                    report.failed += 1;
                    if !self.network.is_online() {
                        warn!("网络中断，本批剩余操作放回队列");
                        for rest in remaining {
                            self.release(&rest, report);
                        }
                        return true;
                    }
                }
                Settled::Conflict(conflict) => {
                    blocked.insert(key);
                    report.conflicts += 1;
                    if let Some(strategy) = self.conflicts.policy_for(&conflict.entity_type) {
                        self.set_phase(SyncPhase::Reconciling);
                        match self.resolve_conflict(&conflict.id, strategy, None).await {
                            Ok(_) => report.auto_resolved += 1,
                            Err(e) => warn!("自动解决冲突 {} 失败，保留待处理: {}", conflict.id, e),
                        }
                        self.set_phase(SyncPhase::Transmitting);
                    }
                }
            }
        }
        false
    }

    fn release(&self, op: &QueuedOperation, report: &mut SyncCycleReport) {
        match self.queue.release(&op.id) {
            Ok(()) => report.released += 1,
            Err(e) => self.storage_failure(Some(&op.id), &e),
        }
    }

    /// 发送单个操作（带超时），并把请求结果反馈给网络监控
    async fn transmit(&self, op: &QueuedOperation) -> Result<ApplyOutcome> {
        let timeout_ms = self
            .config
            .transmit_timeout_ms
            .unwrap_or_else(|| op.priority.timeout_ms());
        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.remote.apply(
                &op.entity_type,
                &op.entity_id,
                op.action,
                &op.payload,
                op.expected_version.as_deref(),
            ),
        )
        .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(result) => result,
            Err(_) => Err(FitsyncSDKError::Timeout(format!(
                "操作 {} 发送超时 ({}ms)",
                op.id, timeout_ms
            ))),
        };
        match &result {
            Ok(_) => self.network.record_request(latency_ms, true),
            Err(e) if e.is_retryable() => self.network.record_request(latency_ms, false),
            Err(_) => {}
        }
        result
    }

    /// 把远端结果落实到队列、缓存和冲突表
    fn settle(&self, op: &QueuedOperation, outcome: Result<ApplyOutcome>) -> Settled {
        match outcome {
            Ok(ApplyOutcome::Accepted { version, .. }) => {
                if let Err(e) = self.queue.mark_done(&op.id) {
                    self.storage_failure(Some(&op.id), &e);
                    return Settled::Failed;
                }
                debug!("远端接受 {} ({})，版本 {}", op.id, op.entity_key(), version);
                if let Err(e) = self.invalidate_entity(&op.entity_type, &op.entity_id) {
                    self.storage_failure(Some(&op.id), &e);
                }
                Settled::Done
            }
            Ok(ApplyOutcome::Rejected { reason }) => {
                warn!("远端拒绝 {} ({}): {}", op.id, op.entity_key(), reason);
                if let Err(e) = self.queue.mark_failed(
                    &op.id,
                    &reason,
                    SyncFailureReason::Validation(reason.clone()),
                ) {
                    self.storage_failure(Some(&op.id), &e);
                }
                Settled::Rejected
            }
            Ok(ApplyOutcome::Conflict {
                current_version,
                remote_record,
            }) => match self.conflicts.register(op, current_version, remote_record) {
                Ok(conflict) => Settled::Conflict(conflict),
                Err(e) => {
                    self.storage_failure(Some(&op.id), &e);
                    if let Err(e) = self.queue.release(&op.id) {
                        self.storage_failure(Some(&op.id), &e);
                    }
                    Settled::Failed
                }
            },
            Err(err) => {
                let reason = SyncFailureReason::from(&err);
                if let Err(e) = self.queue.mark_failed(&op.id, &err.to_string(), reason) {
                    self.storage_failure(Some(&op.id), &e);
                }
                Settled::Failed
            }
        }
    }

    /// 解决冲突。已解决的冲突直接返回保存的结果，不会再次访问远端。
    #[instrument(skip(self, merged_value))]
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
        merged_value: Option<Value>,
    ) -> Result<ResolveOutcome> {
        let _resolving = self.resolve_lock.lock().await;
        let conflict = self.conflicts.get(conflict_id)?;
        if conflict.is_resolved() {
            debug!("冲突 {} 已解决，返回保存的结果", conflict_id);
            return Ok(self.outcome(&conflict, true));
        }

        match self.conflicts.plan(&conflict, strategy, merged_value)? {
            ResolutionPlan::AdoptRemote { record } => {
                self.queue.remove(&conflict.operation_id)?;
                self.invalidate_entity(&conflict.entity_type, &conflict.entity_id)?;
                self.cache.set_json(
                    &entity_cache_key(&conflict.entity_type, &conflict.entity_id),
                    &record,
                    CacheSetOptions::new().tags(entity_tags(&conflict.entity_type, &conflict.entity_id)),
                )?;
                let resolved = self
                    .conflicts
                    .record_resolution(conflict, ConflictResolution::Remote, record)?;
                Ok(self.outcome(&resolved, false))
            }
            ResolutionPlan::Resubmit {
                payload,
                expected_version,
                resolution,
            } => {
                let op = self.queue.prepare_resubmit(
                    &conflict.operation_id,
                    payload.clone(),
                    Some(expected_version),
                )?;
                let resolved = self.conflicts.record_resolution(conflict, resolution, payload)?;

                // 重新发送失败时交给队列退避重试；再次冲突会登记新的冲突
                let outcome = self.transmit(&op).await;
                if let Settled::Conflict(again) = self.settle(&op, outcome) {
                    warn!("重新提交后远端版本再次变化，新冲突 {}", again.id);
                }
                Ok(self.outcome(&resolved, false))
            }
        }
    }

    fn outcome(&self, conflict: &SyncConflict, already_resolved: bool) -> ResolveOutcome {
        ResolveOutcome {
            conflict_id: conflict.id.clone(),
            operation_id: conflict.operation_id.clone(),
            resolution: conflict.resolution,
            record: conflict.resolved_record.clone(),
            resolved_at: conflict.resolved_at,
            already_resolved,
            operation_status: self.queue.get(&conflict.operation_id).map(|o| o.status),
        }
    }

    /// 从远端拉取某类实体写入缓存，返回写入条数
    #[instrument(skip(self))]
    pub async fn refresh(&self, entity_type: &str, filter: &FetchFilter) -> Result<usize> {
        if !self.network.sync_gate().may_transmit() {
            return Err(FitsyncSDKError::TransientNetwork("当前离线，无法拉取".to_string()));
        }

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(self.config.fetch_timeout_ms),
            self.remote.fetch(entity_type, filter),
        )
        .await
        .unwrap_or_else(|_| Err(FitsyncSDKError::Timeout(format!("拉取 {} 超时", entity_type))));
        let latency_ms = started.elapsed().as_millis() as u64;

        let records = match result {
            Ok(records) => {
                self.network.record_request(latency_ms, true);
                records
            }
            Err(e) => {
                if e.is_retryable() {
                    self.network.record_request(latency_ms, false);
                }
                return Err(e);
            }
        };

        for record in &records {
            self.cache.set_json(
                &entity_cache_key(entity_type, &record.entity_id),
                &record.data,
                CacheSetOptions::new().tags(entity_tags(entity_type, &record.entity_id)),
            )?;
        }
        debug!("拉取 {} 条 {} 写入缓存", records.len(), entity_type);
        Ok(records.len())
    }

    fn invalidate_entity(&self, entity_type: &str, entity_id: &str) -> Result<usize> {
        self.cache.clear_by_tags(&invalidation_tags(entity_type, entity_id))
    }

    fn storage_failure(&self, operation_id: Option<&str>, err: &FitsyncSDKError) {
        error!("本地存储异常 (operation={:?}): {}", operation_id, err);
        self.events.emit(SDKEvent::StorageFailure {
            operation_id: operation_id.map(str::to_string),
            error: err.to_string(),
            timestamp: self.clock.now_ms(),
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::network::NetworkConfig;
    use crate::storage::queue::{QueueConfig, RetryPolicy};
    use crate::storage::AccountStorage;
    use crate::sync::remote::InMemoryRemoteStore;
    use crate::utils::ManualClock;
    use tempfile::TempDir;

    pub(crate) struct Harness {
        pub _dir: TempDir,
        pub clock: Arc<ManualClock>,
        pub events: Arc<EventManager>,
        pub queue: Arc<OperationQueue>,
        pub cache: Arc<DurableCache>,
        pub conflicts: Arc<ConflictResolver>,
        pub remote: Arc<InMemoryRemoteStore>,
        pub network: Arc<NetworkMonitor>,
        pub engine: Arc<SyncEngine>,
    }

    pub(crate) async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::default());
        let events = Arc::new(EventManager::default());
        let storage = AccountStorage::open(dir.path(), "tester").await.unwrap();
        let queue = Arc::new(
            OperationQueue::open(
                storage.operations(),
                QueueConfig::default(),
                RetryPolicy {
                    jitter_factor: 0.0,
                    ..Default::default()
                },
                clock.clone(),
                events.clone(),
            )
            .unwrap(),
        );
        let cache = Arc::new(
            DurableCache::open(
                storage.cache_tree().unwrap(),
                CacheConfig::default(),
                clock.clone(),
                events.clone(),
            )
            .unwrap(),
        );
        let conflicts = Arc::new(ConflictResolver::new(storage.conflicts(), clock.clone(), events.clone()));
        let remote = Arc::new(InMemoryRemoteStore::new());
        let network = Arc::new(NetworkMonitor::new(
            None,
            NetworkConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            cache.clone(),
            conflicts.clone(),
            remote.clone(),
            network.clone(),
            SyncEngineConfig::default(),
            clock.clone(),
            events.clone(),
        ));
        Harness {
            _dir: dir,
            clock,
            events,
            queue,
            cache,
            conflicts,
            remote,
            network,
            engine,
        }
    }
}
