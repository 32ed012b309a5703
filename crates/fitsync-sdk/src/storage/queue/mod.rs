//! 操作队列 - 待同步变更的持久化有序存储
//!
//! 特性：
//! - 🔒 每次状态迁移先落盘（SQLite）再确认，重启后完整恢复
//! - 📋 高 > 中 > 低优先级出队，同一优先级按提交顺序
//! - 🧬 同一实体的操作严格按提交顺序发送，不受优先级影响
//! - 🔁 失败按指数退避重试，达到上限后转为永久失败，等待人工重试或丢弃
//! - 🧩 可合并操作在时间窗口内折叠为一个发送单元
//! - 📊 每次状态变化重算 `SyncMetrics` 并发布事件

pub mod coalesce;
pub mod metrics;
pub mod operation;
pub mod priority;
pub mod retry_policy;

pub use coalesce::{coalesce, merge_payload, CoalesceOutcome};
pub use metrics::{OutcomeWindow, SyncMetrics};
pub use operation::{
    EntityKey, NewOperation, OperationAction, OperationFilter, OperationStatus, QueuedOperation,
};
pub use priority::OperationPriority;
pub use retry_policy::{FailureDisposition, RetryPolicy, SyncFailureReason};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FitsyncSDKError, Result};
use crate::events::{EventKind, EventManager, SDKEvent, Subscription};
use crate::storage::OperationStore;
use crate::utils::Clock;

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 合并窗口（毫秒）
    pub batch_window_ms: u64,
    /// 成功率 / 平均耗时统计的样本数
    pub metrics_window: usize,
    /// 优先级老化间隔；None 表示关闭老化
    pub aging_interval_ms: Option<u64>,
    /// 已完成操作的保留时长（毫秒）
    pub completed_retention_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_window_ms: 5_000,
            metrics_window: 100,
            aging_interval_ms: Some(10 * 60 * 1_000),
            completed_retention_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    ops: HashMap<String, QueuedOperation>,
    next_seq: u64,
    window: OutcomeWindow,
    metrics: SyncMetrics,
}

impl QueueState {
    /// 同一实体所有未完成操作的 seq，升序
    fn unfinished_seqs_by_entity(&self) -> HashMap<EntityKey, Vec<u64>> {
        let mut by_entity: HashMap<EntityKey, Vec<u64>> = HashMap::new();
        for op in self.ops.values().filter(|o| !o.is_finished()) {
            by_entity.entry(op.entity_key()).or_default().push(op.seq);
        }
        for seqs in by_entity.values_mut() {
            seqs.sort_unstable();
        }
        by_entity
    }

    fn latest_unfinished_for(&self, entity_type: &str, entity_id: &str) -> Option<&QueuedOperation> {
        self.ops
            .values()
            .filter(|o| !o.is_finished() && o.entity_type == entity_type && o.entity_id == entity_id)
            .max_by_key(|o| o.seq)
    }

    fn has_earlier_unfinished(&self, op: &QueuedOperation) -> bool {
        self.ops.values().any(|o| {
            !o.is_finished()
                && o.seq < op.seq
                && o.entity_type == op.entity_type
                && o.entity_id == op.entity_id
        })
    }
}

/// 操作队列
pub struct OperationQueue {
    store: OperationStore,
    config: QueueConfig,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    state: Mutex<QueueState>,
    work_available: Arc<Notify>,
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl OperationQueue {
    /// 从存储恢复队列
    pub fn open(
        store: OperationStore,
        config: QueueConfig,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let loaded = store.load_all()?;
        let next_seq = loaded.iter().map(|o| o.seq).max().map_or(1, |s| s + 1);
        let window = OutcomeWindow::new(config.metrics_window);
        let ops: HashMap<String, QueuedOperation> =
            loaded.into_iter().map(|o| (o.id.clone(), o)).collect();
        let metrics = SyncMetrics::compute(ops.values(), &window);

        info!(
            "✅ 操作队列已加载: {} 条记录，待同步 {} 条",
            ops.len(),
            metrics.unsynced_count()
        );

        Ok(Self {
            store,
            config,
            retry_policy,
            clock,
            events,
            state: Mutex::new(QueueState {
                ops,
                next_seq,
                window,
                metrics,
            }),
            work_available: Arc::new(Notify::new()),
        })
    }

    /// 进程中断时仍处于处理中的操作回到待发送；`awaiting_resolution` 中的操作在等冲突解决，保持不动
    pub fn recover_interrupted(&self, awaiting_resolution: &HashSet<String>) -> Result<usize> {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        let recovered = {
            let mut state = self.state.lock();
            let mut recovered: Vec<QueuedOperation> = state
                .ops
                .values()
                .filter(|o| {
                    o.status == OperationStatus::Processing && !awaiting_resolution.contains(&o.id)
                })
                .cloned()
                .collect();
            for op in &mut recovered {
                op.release(now);
            }
            self.store.upsert_many(&recovered)?;
            for op in &recovered {
                state.ops.insert(op.id.clone(), op.clone());
            }
            self.refresh_metrics(&mut state, now, &mut events);
            recovered.len()
        };
        self.emit_all(events);
        if recovered > 0 {
            warn!("恢复了 {} 条上次未完成发送的操作", recovered);
            self.work_available.notify_one();
        }
        Ok(recovered)
    }

    /// 入队：只写本地，不访问网络；返回代表该变更的操作 id
    pub fn enqueue(&self, new_op: NewOperation) -> Result<String> {
        new_op.validate()?;
        let now = self.clock.now_ms();
        let new_id = Uuid::new_v4().to_string();
        let mut events = Vec::new();

        {
            let mut state = self.state.lock();
            let earlier = state
                .latest_unfinished_for(&new_op.entity_type, &new_op.entity_id)
                .cloned();
            let outcome = earlier
                .as_ref()
                .map(|e| coalesce(e, &new_op, now, self.config.batch_window_ms))
                .unwrap_or(CoalesceOutcome::Separate);

            match (outcome, earlier) {
                (
                    CoalesceOutcome::Merged {
                        action,
                        payload,
                        expected_version,
                    },
                    Some(earlier),
                ) => {
                    let priority = earlier.priority.min(new_op.priority);
                    let mut op =
                        QueuedOperation::from_new(new_op, new_id.clone(), earlier.seq, earlier.created_at);
                    op.action = action;
                    op.payload = payload;
                    op.expected_version = expected_version;
                    op.priority = priority;
                    op.updated_at = now;

                    self.store.replace(std::slice::from_ref(&earlier.id), Some(&op))?;
                    state.ops.remove(&earlier.id);
                    debug!("合并操作 {} -> {} ({})", earlier.id, op.id, op.entity_key());
                    events.push(SDKEvent::OperationsCoalesced {
                        entity_type: op.entity_type.clone(),
                        entity_id: op.entity_id.clone(),
                        kept_id: Some(op.id.clone()),
                        removed_ids: vec![earlier.id.clone()],
                        timestamp: now,
                    });
                    state.ops.insert(op.id.clone(), op);
                }
                (CoalesceOutcome::Cancelled, Some(earlier)) => {
                    self.store.replace(std::slice::from_ref(&earlier.id), None)?;
                    state.ops.remove(&earlier.id);
                    info!(
                        "未同步的 create 与 delete 互相抵消: {} ({})",
                        earlier.id,
                        earlier.entity_key()
                    );
                    events.push(SDKEvent::OperationsCoalesced {
                        entity_type: earlier.entity_type.clone(),
                        entity_id: earlier.entity_id.clone(),
                        kept_id: None,
                        removed_ids: vec![earlier.id.clone(), new_id.clone()],
                        timestamp: now,
                    });
                }
                _ => {
                    let seq = state.next_seq;
                    let op = QueuedOperation::from_new(new_op, new_id.clone(), seq, now);
                    self.store.upsert(&op)?;
                    state.next_seq += 1;
                    debug!(
                        "操作入队: {} {} {} (priority={})",
                        op.id,
                        op.action,
                        op.entity_key(),
                        op.priority.name()
                    );
                    events.push(status_event(&op, now));
                    state.ops.insert(op.id.clone(), op);
                }
            }
            self.refresh_metrics(&mut state, now, &mut events);
        }

        self.emit_all(events);
        self.work_available.notify_one();
        Ok(new_id)
    }

    /// 取出下一批可发送的操作并认领（置为处理中）。
    /// 只有当同一实体所有更早的未完成操作都已在本批次内时，一个操作才可被选中。
    pub fn dequeue_batch(&self, max: usize) -> Result<Vec<QueuedOperation>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now_ms();
        let mut events = Vec::new();

        let claimed = {
            let mut state = self.state.lock();
            let selected = self.select_eligible(&state, now, max);
            if selected.is_empty() {
                return Ok(Vec::new());
            }

            let mut claimed = Vec::with_capacity(selected.len());
            for id in &selected {
                if let Some(op) = state.ops.get(id) {
                    let mut op = op.clone();
                    op.mark_processing(now);
                    claimed.push(op);
                }
            }
            self.store.upsert_many(&claimed)?;
            for op in &claimed {
                events.push(status_event(op, now));
                state.ops.insert(op.id.clone(), op.clone());
            }
            self.refresh_metrics(&mut state, now, &mut events);
            claimed
        };

        debug!("出队 {} 条操作", claimed.len());
        self.emit_all(events);
        Ok(claimed)
    }

    /// 当前是否有可出队的操作
    pub fn has_eligible(&self) -> bool {
        let now = self.clock.now_ms();
        let state = self.state.lock();
        !self.select_eligible(&state, now, 1).is_empty()
    }

    fn select_eligible(&self, state: &QueueState, now: i64, max: usize) -> Vec<String> {
        let by_entity = state.unfinished_seqs_by_entity();
        let mut candidates: Vec<&QueuedOperation> =
            state.ops.values().filter(|o| o.is_dispatchable(now)).collect();
        candidates.sort_by_key(|o| {
            (
                o.priority
                    .aged_value(now - o.created_at, self.config.aging_interval_ms),
                o.seq,
            )
        });

        let mut selected: Vec<String> = Vec::new();
        let mut selected_seqs: HashSet<u64> = HashSet::new();
        // 低优先级的前驱被选中后，同一实体的高优先级后继在下一轮才可选
        loop {
            let mut progressed = false;
            for op in &candidates {
                if selected.len() >= max {
                    break;
                }
                if selected_seqs.contains(&op.seq) {
                    continue;
                }
                let predecessors_ready = by_entity
                    .get(&op.entity_key())
                    .map(|seqs| {
                        seqs.iter()
                            .take_while(|s| **s < op.seq)
                            .all(|s| selected_seqs.contains(s))
                    })
                    .unwrap_or(true);
                if predecessors_ready {
                    selected_seqs.insert(op.seq);
                    selected.push(op.id.clone());
                    progressed = true;
                }
            }
            if !progressed || selected.len() >= max {
                break;
            }
        }
        selected
    }

    /// 单独认领一个操作
    pub fn mark_processing(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.transition(id, now, |state, op| {
            if !op.is_dispatchable(now) {
                return Err(FitsyncSDKError::InvalidOperation(format!(
                    "操作 {} 当前状态 {} 不可发送",
                    op.id,
                    op.status.as_str()
                )));
            }
            if state.has_earlier_unfinished(op) {
                return Err(FitsyncSDKError::InvalidOperation(format!(
                    "实体 {} 存在更早的未完成操作",
                    op.entity_key()
                )));
            }
            let mut next = op.clone();
            next.mark_processing(now);
            Ok(next)
        })
        .map(|_| ())
    }

    /// 远端已接受
    pub fn mark_done(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let op = self.transition(id, now, |state, op| {
            ensure_processing(op)?;
            let mut next = op.clone();
            let latency = next.processing_latency_ms(now).unwrap_or(0);
            next.mark_done(now);
            state.window.record(true, latency);
            Ok(next)
        })?;
        debug!("✅ 操作同步完成: {} ({})", op.id, op.entity_key());
        Ok(())
    }

    /// 发送失败：计入一次失败并按退避策略安排下一次尝试
    pub fn mark_failed(
        &self,
        id: &str,
        error: &str,
        reason: SyncFailureReason,
    ) -> Result<FailureDisposition> {
        let now = self.clock.now_ms();
        let mut disposition = FailureDisposition::Permanent;
        let op = self.transition(id, now, |state, op| {
            ensure_processing(op)?;
            let mut next = op.clone();
            let latency = next.processing_latency_ms(now).unwrap_or(0);
            disposition = self.retry_policy.disposition(now, next.attempts + 1, &reason);
            let next_attempt_at = match disposition {
                FailureDisposition::Retry { next_attempt_at } => Some(next_attempt_at),
                FailureDisposition::Permanent => None,
            };
            next.mark_failed(error, reason.clone(), next_attempt_at, now);
            state.window.record(false, latency);
            Ok(next)
        })?;

        match disposition {
            FailureDisposition::Retry { next_attempt_at } => warn!(
                "操作发送失败，第 {} 次，{}ms 后重试: {} ({}) - {}",
                op.attempts,
                next_attempt_at - now,
                op.id,
                op.entity_key(),
                error
            ),
            FailureDisposition::Permanent => warn!(
                "❌ 操作永久失败（{} 次尝试）: {} ({}) - {}",
                op.attempts,
                op.id,
                op.entity_key(),
                error
            ),
        }
        Ok(disposition)
    }

    /// 放回待发送，不计失败次数（例如网络中途断开、批次被中止）
    pub fn release(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        self.transition(id, now, |_, op| {
            ensure_processing(op)?;
            let mut next = op.clone();
            next.release(now);
            Ok(next)
        })?;
        self.work_available.notify_one();
        Ok(())
    }

    /// 冲突解决后以新的负载和版本号重新发送；操作保持处理中
    pub fn prepare_resubmit(
        &self,
        id: &str,
        payload: Value,
        expected_version: Option<String>,
    ) -> Result<QueuedOperation> {
        let now = self.clock.now_ms();
        self.transition(id, now, |_, op| {
            ensure_processing(op)?;
            let mut next = op.clone();
            next.payload = payload.clone();
            next.expected_version = expected_version.clone();
            next.updated_at = now;
            Ok(next)
        })
    }

    /// 撤销尚未开始发送的操作；已认领或已完成时返回 false
    pub fn cancel(&self, id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        let cancelled = {
            let mut state = self.state.lock();
            let Some(op) = state.ops.get(id) else {
                return Ok(false);
            };
            if !matches!(op.status, OperationStatus::Pending | OperationStatus::Failed) {
                debug!("操作 {} 状态为 {}，无法撤销", id, op.status.as_str());
                return Ok(false);
            }
            self.store.delete(id)?;
            let op = state.ops.remove(id);
            self.refresh_metrics(&mut state, now, &mut events);
            op
        };
        if let Some(op) = &cancelled {
            info!("操作已撤销: {} ({})", op.id, op.entity_key());
        }
        self.emit_all(events);
        Ok(cancelled.is_some())
    }

    /// 人工重试一个失败的操作
    pub fn retry(&self, id: &str) -> Result<bool> {
        let now = self.clock.now_ms();
        let result = self.transition(id, now, |_, op| {
            if op.status != OperationStatus::Failed {
                return Err(FitsyncSDKError::InvalidOperation(format!(
                    "操作 {} 不是失败状态",
                    op.id
                )));
            }
            let mut next = op.clone();
            next.reset_for_retry(now);
            Ok(next)
        });
        match result {
            Ok(_) => {
                self.work_available.notify_one();
                Ok(true)
            }
            Err(FitsyncSDKError::InvalidOperation(_)) | Err(FitsyncSDKError::NotFound(_)) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub fn retry_all_failed(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .failed_operations()
            .into_iter()
            .map(|o| o.id)
            .collect();
        let mut count = 0;
        for id in ids {
            if self.retry(&id)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// 无论状态直接移除（保留远端版本时使用）
    pub fn remove(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        let removed = {
            let mut state = self.state.lock();
            if !state.ops.contains_key(id) {
                return Ok(None);
            }
            self.store.delete(id)?;
            let removed = state.ops.remove(id);
            self.refresh_metrics(&mut state, now, &mut events);
            removed
        };
        self.emit_all(events);
        self.work_available.notify_one();
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<QueuedOperation> {
        self.state.lock().ops.get(id).cloned()
    }

    /// 按提交顺序列出匹配的操作
    pub fn list(&self, filter: &OperationFilter) -> Vec<QueuedOperation> {
        let state = self.state.lock();
        let mut ops: Vec<QueuedOperation> =
            state.ops.values().filter(|o| filter.matches(o)).cloned().collect();
        ops.sort_by_key(|o| o.seq);
        ops
    }

    /// 等待同步的变更数（未完成的操作）
    pub fn pending_count(&self) -> usize {
        self.state.lock().ops.values().filter(|o| !o.is_finished()).count()
    }

    pub fn failed_operations(&self) -> Vec<QueuedOperation> {
        self.list(&OperationFilter::new().status(OperationStatus::Failed))
    }

    pub fn metrics(&self) -> SyncMetrics {
        self.state.lock().metrics.clone()
    }

    /// 注册指标变化回调
    pub fn on_metrics<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncMetrics) + Send + Sync + 'static,
    {
        self.events.add_listener(EventKind::Metrics, move |event| {
            if let SDKEvent::MetricsChanged { metrics, .. } = event {
                handler(metrics);
            }
        })
    }

    /// 最早的下一次重试时间
    pub fn next_retry_at(&self) -> Option<i64> {
        self.state
            .lock()
            .ops
            .values()
            .filter(|o| o.status == OperationStatus::Failed && !o.permanent_failure)
            .filter_map(|o| o.next_attempt_at)
            .min()
    }

    /// 清理保留期之前完成的操作
    pub fn compact(&self) -> Result<usize> {
        let now = self.clock.now_ms();
        let before = now - self.config.completed_retention_ms as i64;
        let pruned = self.store.prune_done(before)?;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ops.retain(|_, o| {
                !(o.status == OperationStatus::Done && o.completed_at.map_or(false, |t| t < before))
            });
            self.refresh_metrics(&mut state, now, &mut events);
        }
        self.emit_all(events);
        if pruned > 0 {
            debug!("清理已完成操作 {} 条", pruned);
        }
        Ok(pruned)
    }

    /// 清空全部操作（退出登录 / 切换账号）
    pub fn reset(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.store.clear()?;
            state.ops.clear();
            state.window.clear();
            self.refresh_metrics(&mut state, now, &mut events);
        }
        self.emit_all(events);
        info!("操作队列已重置");
        Ok(())
    }

    /// 有新工作时唤醒调度器
    pub fn work_notifier(&self) -> Arc<Notify> {
        self.work_available.clone()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// 对单个操作做一次状态迁移：先落盘，成功后再更新内存
    fn transition<F>(&self, id: &str, now: i64, f: F) -> Result<QueuedOperation>
    where
        F: FnOnce(&mut QueueState, &QueuedOperation) -> Result<QueuedOperation>,
    {
        let mut events = Vec::new();
        let next = {
            let mut state = self.state.lock();
            let current = state
                .ops
                .get(id)
                .cloned()
                .ok_or_else(|| FitsyncSDKError::NotFound(format!("操作 {}", id)))?;
            let window_before = state.window.clone();
            let next = f(&mut state, &current)?;
            if let Err(e) = self.store.upsert(&next) {
                state.window = window_before;
                return Err(e);
            }
            events.push(status_event(&next, now));
            state.ops.insert(next.id.clone(), next.clone());
            self.refresh_metrics(&mut state, now, &mut events);
            next
        };
        self.emit_all(events);
        Ok(next)
    }

    fn refresh_metrics(&self, state: &mut QueueState, now: i64, events: &mut Vec<SDKEvent>) {
        let metrics = SyncMetrics::compute(state.ops.values(), &state.window);
        if metrics != state.metrics {
            state.metrics = metrics.clone();
            events.push(SDKEvent::MetricsChanged {
                metrics,
                timestamp: now,
            });
        }
    }

    fn emit_all(&self, events: Vec<SDKEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }
}

fn ensure_processing(op: &QueuedOperation) -> Result<()> {
    if op.status != OperationStatus::Processing {
        return Err(FitsyncSDKError::InvalidOperation(format!(
            "操作 {} 不在处理中（当前 {}）",
            op.id,
            op.status.as_str()
        )));
    }
    Ok(())
}

fn status_event(op: &QueuedOperation, now: i64) -> SDKEvent {
    SDKEvent::OperationStatusChanged {
        operation_id: op.id.clone(),
        entity_type: op.entity_type.clone(),
        entity_id: op.entity_id.clone(),
        status: op.status,
        attempts: op.attempts,
        permanent: op.permanent_failure,
        error: op.last_error.clone(),
        timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_connection;
    use crate::utils::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        queue: OperationQueue,
        clock: Arc<ManualClock>,
        store: OperationStore,
        events: Arc<EventManager>,
    }

    fn fixture_with(config: QueueConfig) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = OperationStore::new(open_memory_connection().unwrap());
        let events = Arc::new(EventManager::new(64));
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        let queue = OperationQueue::open(store.clone(), config, policy, clock.clone(), events.clone())
            .unwrap();
        Fixture {
            queue,
            clock,
            store,
            events,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(QueueConfig::default())
    }

    fn update(id: &str, priority: OperationPriority) -> NewOperation {
        NewOperation::new("workout", id, OperationAction::Update, json!({"name": id}))
            .with_priority(priority)
    }

    fn ids(ops: &[QueuedOperation]) -> Vec<String> {
        ops.iter().map(|o| o.entity_id.clone()).collect()
    }

    #[test]
    fn test_priority_then_submission_order() {
        let f = fixture();
        f.queue.enqueue(update("l1", OperationPriority::Low)).unwrap();
        f.queue.enqueue(update("h1", OperationPriority::High)).unwrap();
        f.queue.enqueue(update("m1", OperationPriority::Medium)).unwrap();
        f.queue.enqueue(update("h2", OperationPriority::High)).unwrap();
        f.queue.enqueue(update("l2", OperationPriority::Low)).unwrap();

        let batch = f.queue.dequeue_batch(10).unwrap();
        assert_eq!(ids(&batch), vec!["h1", "h2", "m1", "l1", "l2"]);
        assert!(batch.iter().all(|o| o.status == OperationStatus::Processing));
    }

    #[test]
    fn test_concurrent_batches_do_not_overlap() {
        let f = fixture();
        for i in 0..5 {
            f.queue.enqueue(update(&format!("w{}", i), OperationPriority::Medium)).unwrap();
        }
        let first = f.queue.dequeue_batch(3).unwrap();
        let second = f.queue.dequeue_batch(3).unwrap();
        assert_eq!(ids(&first), vec!["w0", "w1", "w2"]);
        assert_eq!(ids(&second), vec!["w3", "w4"]);
        assert!(f.queue.dequeue_batch(3).unwrap().is_empty());
    }

    #[test]
    fn test_same_entity_keeps_submission_order_across_priorities() {
        let f = fixture();
        let first = f
            .queue
            .enqueue(
                NewOperation::new("workout", "42", OperationAction::Update, json!({"sets": 3}))
                    .with_priority(OperationPriority::Low),
            )
            .unwrap();
        let second = f
            .queue
            .enqueue(
                NewOperation::new("workout", "42", OperationAction::Update, json!({"sets": 4}))
                    .with_priority(OperationPriority::High),
            )
            .unwrap();

        // 批次容量为 1 时只能先发较早的低优先级操作
        let batch = f.queue.dequeue_batch(1).unwrap();
        assert_eq!(batch[0].id, first);
        // 前一个还在处理中，后一个不可出队
        assert!(f.queue.dequeue_batch(1).unwrap().is_empty());
        assert!(f.queue.mark_processing(&second).is_err());

        f.queue.mark_done(&first).unwrap();
        let batch = f.queue.dequeue_batch(1).unwrap();
        assert_eq!(batch[0].id, second);
    }

    #[test]
    fn test_same_entity_both_in_one_batch_in_order() {
        let f = fixture();
        let a = f
            .queue
            .enqueue(update("42", OperationPriority::Low))
            .unwrap();
        let b = f
            .queue
            .enqueue(update("42", OperationPriority::High))
            .unwrap();
        let batch = f.queue.dequeue_batch(5).unwrap();
        let order: Vec<_> = batch.iter().map(|o| o.id.clone()).collect();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn test_failure_backoff_and_ceiling() {
        let f = fixture();
        let id = f.queue.enqueue(update("42", OperationPriority::Medium)).unwrap();

        let mut last_delay = 0;
        for attempt in 1..=5u32 {
            let batch = f.queue.dequeue_batch(1).unwrap();
            assert_eq!(batch.len(), 1, "attempt {}", attempt);
            let now = f.clock.now_ms();
            match f.queue.mark_failed(&id, "timeout", SyncFailureReason::NetworkTimeout).unwrap() {
                FailureDisposition::Retry { next_attempt_at } => {
                    let delay = next_attempt_at - now;
                    assert!(delay >= last_delay);
                    last_delay = delay;
                    assert!(f.queue.dequeue_batch(1).unwrap().is_empty());
                    f.clock.set(next_attempt_at);
                }
                FailureDisposition::Permanent => {
                    assert_eq!(attempt, 5);
                }
            }
        }

        let op = f.queue.get(&id).unwrap();
        assert_eq!(op.attempts, 5);
        assert!(op.is_permanent_failure());
        assert_eq!(f.queue.failed_operations().len(), 1);
        assert_eq!(f.queue.metrics().permanent_failure_count, 1);

        // 人工重试后可再次出队
        assert!(f.queue.retry(&id).unwrap());
        assert_eq!(f.queue.dequeue_batch(1).unwrap().len(), 1);
    }

    #[test]
    fn test_validation_failure_is_permanent() {
        let f = fixture();
        let id = f.queue.enqueue(update("42", OperationPriority::Medium)).unwrap();
        f.queue.dequeue_batch(1).unwrap();
        let d = f
            .queue
            .mark_failed(&id, "name too long", SyncFailureReason::Validation("name".into()))
            .unwrap();
        assert_eq!(d, FailureDisposition::Permanent);
        f.clock.advance(Duration::from_secs(3600));
        assert!(f.queue.dequeue_batch(1).unwrap().is_empty());
    }

    #[test]
    fn test_permanent_failure_blocks_later_ops_of_same_entity() {
        let f = fixture();
        let first = f.queue.enqueue(update("42", OperationPriority::Medium)).unwrap();
        f.queue.dequeue_batch(1).unwrap();
        f.queue
            .mark_failed(&first, "bad", SyncFailureReason::Validation("bad".into()))
            .unwrap();
        f.queue.enqueue(update("42", OperationPriority::Medium)).unwrap();
        f.queue.enqueue(update("7", OperationPriority::Medium)).unwrap();

        let batch = f.queue.dequeue_batch(10).unwrap();
        assert_eq!(ids(&batch), vec!["7"]);

        // 丢弃失败的操作后，后续操作放行
        assert!(f.queue.cancel(&first).unwrap());
        assert_eq!(ids(&f.queue.dequeue_batch(10).unwrap()), vec!["42"]);
    }

    #[test]
    fn test_cancel_only_before_processing() {
        let f = fixture();
        let a = f.queue.enqueue(update("a", OperationPriority::Medium)).unwrap();
        let b = f.queue.enqueue(update("b", OperationPriority::Medium)).unwrap();
        assert!(f.queue.cancel(&a).unwrap());
        assert!(f.queue.get(&a).is_none());

        f.queue.mark_processing(&b).unwrap();
        assert!(!f.queue.cancel(&b).unwrap());
        assert!(!f.queue.cancel("missing").unwrap());
        assert_eq!(f.queue.pending_count(), 1);
    }

    #[test]
    fn test_update_then_delete_coalesces_to_single_delete() {
        let f = fixture();
        let update_id = f
            .queue
            .enqueue(
                NewOperation::new("workout", "42", OperationAction::Update, json!({"name": "A"}))
                    .batchable(true),
            )
            .unwrap();
        let delete_id = f
            .queue
            .enqueue(
                NewOperation::new("workout", "42", OperationAction::Delete, json!({})).batchable(true),
            )
            .unwrap();

        assert!(f.queue.get(&update_id).is_none());
        let batch = f.queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, delete_id);
        assert_eq!(batch[0].action, OperationAction::Delete);
        // 持久化层也只剩一条
        assert_eq!(f.store.count().unwrap(), 1);
    }

    #[test]
    fn test_create_then_delete_cancels_both() {
        let f = fixture();
        let coalesced = Arc::new(AtomicUsize::new(0));
        let c = coalesced.clone();
        let _sub = f.events.add_listener(EventKind::Operation, move |e| {
            if let SDKEvent::OperationsCoalesced { kept_id: None, removed_ids, .. } = e {
                c.fetch_add(removed_ids.len(), Ordering::SeqCst);
            }
        });

        f.queue
            .enqueue(NewOperation::new("workout", "local-1", OperationAction::Create, json!({"name": "A"})).batchable(true))
            .unwrap();
        f.queue
            .enqueue(NewOperation::new("workout", "local-1", OperationAction::Delete, json!({})).batchable(true))
            .unwrap();

        assert_eq!(f.queue.pending_count(), 0);
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(coalesced.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reopen_recovers_state() {
        let clock = Arc::new(ManualClock::default());
        let store = OperationStore::new(open_memory_connection().unwrap());
        let events = Arc::new(EventManager::new(16));
        let queue = OperationQueue::open(
            store.clone(),
            QueueConfig::default(),
            RetryPolicy::default(),
            clock.clone(),
            events.clone(),
        )
        .unwrap();
        let a = queue.enqueue(update("a", OperationPriority::Medium)).unwrap();
        let b = queue.enqueue(update("b", OperationPriority::Medium)).unwrap();
        queue.dequeue_batch(2).unwrap();
        drop(queue);

        let queue = OperationQueue::open(store, QueueConfig::default(), RetryPolicy::default(), clock, events)
            .unwrap();
        let awaiting: HashSet<String> = [b.clone()].into_iter().collect();
        assert_eq!(queue.recover_interrupted(&awaiting).unwrap(), 1);
        assert_eq!(queue.get(&a).unwrap().status, OperationStatus::Pending);
        assert_eq!(queue.get(&b).unwrap().status, OperationStatus::Processing);

        // 新入队的操作排在已有操作之后
        let c = queue.enqueue(update("c", OperationPriority::Medium)).unwrap();
        assert!(queue.get(&c).unwrap().seq > queue.get(&b).unwrap().seq);
    }

    #[test]
    fn test_metrics_listener_and_rates() {
        let f = fixture();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = f.queue.on_metrics(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let a = f.queue.enqueue(update("a", OperationPriority::Medium)).unwrap();
        let b = f.queue.enqueue(update("b", OperationPriority::Medium)).unwrap();
        f.queue.dequeue_batch(2).unwrap();
        f.clock.advance(Duration::from_millis(200));
        f.queue.mark_done(&a).unwrap();
        f.queue.mark_failed(&b, "503", SyncFailureReason::ServerError(503)).unwrap();

        let metrics = f.queue.metrics();
        assert_eq!(metrics.done_count, 1);
        assert_eq!(metrics.failed_count, 1);
        assert!((metrics.success_rate - 0.5).abs() < 1e-9);
        assert!((metrics.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!(calls.load(Ordering::SeqCst) >= 4);

        assert!(sub.unsubscribe());
        let before = calls.load(Ordering::SeqCst);
        f.queue.enqueue(update("c", OperationPriority::Medium)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_aging_promotes_old_low_priority() {
        let f = fixture_with(QueueConfig {
            aging_interval_ms: Some(60_000),
            ..Default::default()
        });
        f.queue.enqueue(update("old-low", OperationPriority::Low)).unwrap();
        f.clock.advance(Duration::from_secs(120));
        f.queue.enqueue(update("new-high", OperationPriority::High)).unwrap();

        // 等待 2 个老化间隔后低优先级与高优先级同级，按提交顺序在前
        let batch = f.queue.dequeue_batch(2).unwrap();
        assert_eq!(ids(&batch), vec!["old-low", "new-high"]);
    }

    #[test]
    fn test_compact_and_reset() {
        let f = fixture();
        let a = f.queue.enqueue(update("a", OperationPriority::Medium)).unwrap();
        f.queue.enqueue(update("b", OperationPriority::Medium)).unwrap();
        f.queue.mark_processing(&a).unwrap();
        f.queue.mark_done(&a).unwrap();

        assert_eq!(f.queue.compact().unwrap(), 0);
        f.clock.advance(Duration::from_secs(25 * 3600));
        assert_eq!(f.queue.compact().unwrap(), 1);
        assert!(f.queue.get(&a).is_none());

        f.queue.reset().unwrap();
        assert_eq!(f.queue.pending_count(), 0);
        assert_eq!(f.store.count().unwrap(), 0);
        assert_eq!(f.queue.metrics(), SyncMetrics {
            success_rate: 1.0,
            ..Default::default()
        });
    }

    #[test]
    fn test_release_does_not_count_attempt() {
        let f = fixture();
        let id = f.queue.enqueue(update("a", OperationPriority::Medium)).unwrap();
        f.queue.dequeue_batch(1).unwrap();
        f.queue.release(&id).unwrap();
        let op = f.queue.get(&id).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.attempts, 0);
        assert!(f.queue.release(&id).is_err());
    }
}
