//! 事件系统 - 显式的发布 / 订阅
//!
//! - `SDKEvent`：带类型负载的事件
//! - `EventManager`：按 `EventKind` 分发给回调监听器，同时广播给 `subscribe()` 的接收端
//! - `Subscription`：注册监听器返回的句柄，调用 `unsubscribe()` 显式取消
//!
//! 回调在发布方的调用栈上同步执行，分发前会先释放内部锁，
//! 因此回调里可以安全地再次读取队列指标或取消订阅。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::network::NetworkTransition;
use crate::storage::queue::{OperationStatus, SyncMetrics};
use crate::sync::conflict::ConflictResolution;
use crate::sync::sync_engine::SyncCycleReport;

/// 订阅时使用的事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// 队列指标变化
    Metrics,
    /// 网络状态变化
    Network,
    /// 冲突检测与解决
    Conflict,
    /// 单个操作的状态变化
    Operation,
    /// 缓存失效
    Cache,
    /// 同步周期结束
    Sync,
    /// 本地存储故障
    Storage,
    /// 所有事件
    All,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Metrics => "metrics",
            EventKind::Network => "network",
            EventKind::Conflict => "conflict",
            EventKind::Operation => "operation",
            EventKind::Cache => "cache",
            EventKind::Sync => "sync",
            EventKind::Storage => "storage",
            EventKind::All => "*",
        }
    }
}

impl std::str::FromStr for EventKind {
    type Err = crate::error::FitsyncSDKError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics" => Ok(EventKind::Metrics),
            "network" => Ok(EventKind::Network),
            "conflict" => Ok(EventKind::Conflict),
            "operation" => Ok(EventKind::Operation),
            "cache" => Ok(EventKind::Cache),
            "sync" => Ok(EventKind::Sync),
            "storage" => Ok(EventKind::Storage),
            "*" | "all" => Ok(EventKind::All),
            other => Err(crate::error::FitsyncSDKError::InvalidArgument(format!(
                "未知事件类型: {}",
                other
            ))),
        }
    }
}

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    MetricsChanged {
        metrics: SyncMetrics,
        timestamp: i64,
    },
    NetworkChanged {
        transition: NetworkTransition,
    },
    ConflictDetected {
        conflict_id: String,
        operation_id: String,
        entity_type: String,
        entity_id: String,
        timestamp: i64,
    },
    ConflictResolved {
        conflict_id: String,
        operation_id: String,
        resolution: ConflictResolution,
        timestamp: i64,
    },
    OperationStatusChanged {
        operation_id: String,
        entity_type: String,
        entity_id: String,
        status: OperationStatus,
        attempts: u32,
        permanent: bool,
        error: Option<String>,
        timestamp: i64,
    },
    /// 合并入队：`removed_ids` 中的操作被并入 `kept_id`（`None` 表示双方互相抵消）
    OperationsCoalesced {
        entity_type: String,
        entity_id: String,
        kept_id: Option<String>,
        removed_ids: Vec<String>,
        timestamp: i64,
    },
    CacheInvalidated {
        tags: Vec<String>,
        removed: usize,
        timestamp: i64,
    },
    SyncCycleFinished {
        report: SyncCycleReport,
        timestamp: i64,
    },
    /// 本地存储异常，交给宿主应用处理
    StorageFailure {
        operation_id: Option<String>,
        error: String,
        timestamp: i64,
    },
}

impl SDKEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SDKEvent::MetricsChanged { .. } => EventKind::Metrics,
            SDKEvent::NetworkChanged { .. } => EventKind::Network,
            SDKEvent::ConflictDetected { .. } | SDKEvent::ConflictResolved { .. } => {
                EventKind::Conflict
            }
            SDKEvent::OperationStatusChanged { .. } | SDKEvent::OperationsCoalesced { .. } => {
                EventKind::Operation
            }
            SDKEvent::CacheInvalidated { .. } => EventKind::Cache,
            SDKEvent::SyncCycleFinished { .. } => EventKind::Sync,
            SDKEvent::StorageFailure { .. } => EventKind::Storage,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::MetricsChanged { .. } => "metrics_changed",
            SDKEvent::NetworkChanged { .. } => "network_changed",
            SDKEvent::ConflictDetected { .. } => "conflict_detected",
            SDKEvent::ConflictResolved { .. } => "conflict_resolved",
            SDKEvent::OperationStatusChanged { .. } => "operation_status_changed",
            SDKEvent::OperationsCoalesced { .. } => "operations_coalesced",
            SDKEvent::CacheInvalidated { .. } => "cache_invalidated",
            SDKEvent::SyncCycleFinished { .. } => "sync_cycle_finished",
            SDKEvent::StorageFailure { .. } => "storage_failure",
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::MetricsChanged { timestamp, .. }
            | SDKEvent::ConflictDetected { timestamp, .. }
            | SDKEvent::ConflictResolved { timestamp, .. }
            | SDKEvent::OperationStatusChanged { timestamp, .. }
            | SDKEvent::OperationsCoalesced { timestamp, .. }
            | SDKEvent::CacheInvalidated { timestamp, .. }
            | SDKEvent::SyncCycleFinished { timestamp, .. }
            | SDKEvent::StorageFailure { timestamp, .. } => *timestamp,
            SDKEvent::NetworkChanged { transition } => transition.current.last_change_at,
        }
    }
}

pub type EventListener = Arc<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

pub struct EventManager {
    sender: broadcast::Sender<SDKEvent>,
    listeners: RwLock<HashMap<EventKind, Vec<(u64, EventListener)>>>,
    next_listener_id: AtomicU64,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("listener_count", &self.listener_count())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有接收端时 send 会失败，属于正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            listeners
                .get(&event.kind())
                .into_iter()
                .chain(listeners.get(&EventKind::All))
                .flat_map(|v| v.iter().map(|(_, l)| l.clone()))
                .collect()
        };
        for listener in targets {
            listener(&event);
        }
    }

    /// 订阅全部事件的广播流
    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 注册某一类事件的回调
    pub fn add_listener<F>(self: &Arc<Self>, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.listeners.write();
            listeners
                .entry(kind)
                .or_default()
                .push((id, Arc::new(listener)));
            self.stats.write().listener_count = listeners.values().map(Vec::len).sum();
        }
        debug!("Added listener #{} for event kind: {}", id, kind.as_str());

        Subscription {
            id,
            kind,
            manager: Arc::downgrade(self),
        }
    }

    /// 移除监听器，返回是否确实移除
    pub fn remove_listener(&self, kind: EventKind, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let removed = match listeners.get_mut(&kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(lid, _)| *lid != id);
                before != list.len()
            }
            None => false,
        };
        self.stats.write().listener_count = listeners.values().map(Vec::len).sum();
        removed
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// 广播接收端数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 监听器句柄。丢弃句柄不会自动取消订阅，需要显式调用 `unsubscribe`。
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    kind: EventKind,
    manager: Weak<EventManager>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// 取消订阅；事件管理器已销毁或已取消过时返回 false
    pub fn unsubscribe(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.remove_listener(self.kind, self.id),
            None => false,
        }
    }
}
