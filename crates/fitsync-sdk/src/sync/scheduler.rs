//! 后台同步调度
//!
//! 触发一轮同步的时机：
//! - 定时 tick（重试到期、探测间隔到期）
//! - 队列里有新的可发送操作
//! - 网络恢复在线
//!
//! 定期执行维护：清理已完成操作、已解决冲突和过期缓存。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::conflict::ConflictResolver;
use super::sync_engine::{SyncCycleReport, SyncEngine};
use crate::cache::{CacheMaintenanceReport, DurableCache};
use crate::error::{FitsyncSDKError, Result};
use crate::network::NetworkMonitor;
use crate::storage::queue::OperationQueue;
use crate::utils::Clock;

/// 调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// 定时检查间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 维护间隔（毫秒）
    pub maintenance_interval_ms: u64,
    /// 已解决冲突保留时长（毫秒）
    pub conflict_retention_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            maintenance_interval_ms: 60_000,
            conflict_retention_ms: 7 * 24 * 60 * 60 * 1_000,
        }
    }
}

/// 维护结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub compacted_operations: usize,
    pub compacted_conflicts: usize,
    pub cache: CacheMaintenanceReport,
}

/// 一次 tick 的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub cycle: Option<SyncCycleReport>,
    pub maintenance: Option<MaintenanceReport>,
}

pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    queue: Arc<OperationQueue>,
    cache: Arc<DurableCache>,
    conflicts: Arc<ConflictResolver>,
    network: Arc<NetworkMonitor>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    last_maintenance_at: Mutex<Option<i64>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}

impl SyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<SyncEngine>,
        queue: Arc<OperationQueue>,
        cache: Arc<DurableCache>,
        conflicts: Arc<ConflictResolver>,
        network: Arc<NetworkMonitor>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            queue,
            cache,
            conflicts,
            network,
            config,
            clock,
            last_maintenance_at: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().map_or(false, |h| !h.is_finished())
    }

    /// 执行一次调度：到期则维护，有可发送操作且网络放行则同步
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let now = self.clock.now_ms();
        let maintenance_due = self
            .last_maintenance_at
            .lock()
            .map_or(true, |at| now - at >= self.config.maintenance_interval_ms as i64);
        if maintenance_due {
            *self.last_maintenance_at.lock() = Some(now);
            report.maintenance = Some(self.maintain()?);
        }

        if self.queue.has_eligible() && self.network.sync_gate().may_transmit() {
            report.cycle = Some(self.engine.run_cycle().await?);
        }
        Ok(report)
    }

    /// 清理已完成操作、已解决冲突和过期缓存
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let report = MaintenanceReport {
            compacted_operations: self.queue.compact()?,
            compacted_conflicts: self.conflicts.compact(self.config.conflict_retention_ms)?,
            cache: self.cache.maintain()?,
        };
        if report.compacted_operations + report.compacted_conflicts > 0 {
            debug!(
                "维护完成: 清理操作 {}，清理冲突 {}",
                report.compacted_operations, report.compacted_conflicts
            );
        }
        Ok(report)
    }

    /// 启动后台调度任务
    #[instrument(skip(self))]
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().map_or(false, |h| !h.is_finished()) {
            return Err(FitsyncSDKError::InvalidOperation("同步调度已在运行".to_string()));
        }

        let scheduler = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let work = self.queue.work_notifier();
        let mut network_events = self.network.subscribe();
        let period = Duration::from_millis(self.config.tick_interval_ms.max(1));

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = shutdown.notified() => {
                        debug!("同步调度收到停止信号");
                        break;
                    }
                    _ = ticker.tick() => {}
                    _ = work.notified() => {}
                    event = network_events.recv() => match event {
                        Ok(transition) => {
                            if !transition.online_changed() {
                                continue;
                            }
                        }
                        Err(RecvError::Lagged(n)) => warn!("网络事件积压，跳过 {} 条", n),
                        Err(RecvError::Closed) => break,
                    },
                }
                if let Err(e) = scheduler.tick().await {
                    error!("同步调度执行失败: {}", e);
                }
            }
        }));
        info!("✅ 同步调度已启动，间隔 {}ms", self.config.tick_interval_ms);
        Ok(())
    }

    /// 停止后台任务并等待退出
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!("同步调度任务退出异常: {}", e);
            }
            info!("同步调度已停止");
        }
    }
}
