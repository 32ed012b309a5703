//! 统一 SDK 接口 - FitsyncSDK 主入口
//!
//! 分层结构：
//! ```text
//! FitsyncSDK (门面)
//!   ├── NetworkMonitor (网络状态，进程级)
//!   ├── EventManager (事件，进程级)
//!   └── SyncSession (每个账号一个)
//!         ├── AccountStorage (SQLite + sled)
//!         ├── OperationQueue
//!         ├── DurableCache
//!         ├── ConflictResolver
//!         ├── SyncEngine
//!         └── SyncScheduler
//! ```
//!
//! 写操作只进本地队列并立即返回，后台调度在网络放行后同步到远端。
//! 读操作走本地缓存，全部是同步、非阻塞的调用。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheConfig, CacheHealthReport, CacheStats, DurableCache};
use crate::error::{FitsyncSDKError, Result};
use crate::events::{EventKind, EventManager, EventStats, SDKEvent, Subscription};
use crate::network::{NetworkConfig, NetworkMonitor, NetworkState, NetworkStatusListener};
use crate::storage::queue::{
    NewOperation, OperationAction, OperationFilter, OperationPriority, OperationQueue,
    QueueConfig, QueuedOperation, RetryPolicy, SyncMetrics,
};
use crate::storage::{AccountStorage, StorageStats};
use crate::sync::{
    ConflictResolver, ConflictStrategy, FetchFilter, RemoteStore, ResolveOutcome,
    SchedulerConfig, SyncConflict, SyncCycleReport, SyncEngine, SyncEngineConfig, SyncScheduler,
};
use crate::utils::{Clock, SystemClock};
use crate::version;

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// 广播通道容量
    pub channel_capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Fitsync SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitsyncConfig {
    /// 数据存储目录
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub network: NetworkConfig,
    pub sync: SyncEngineConfig,
    pub scheduler: SchedulerConfig,
    pub event: EventConfig,
    /// 打开会话后自动启动后台同步
    pub auto_start: bool,
    pub debug_mode: bool,
}

impl Default for FitsyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            network: NetworkConfig::default(),
            sync: SyncEngineConfig::default(),
            scheduler: SchedulerConfig::default(),
            event: EventConfig::default(),
            auto_start: true,
            debug_mode: false,
        }
    }
}

/// 默认数据目录 ~/.fitsync/
fn default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".fitsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".fitsync")
    } else {
        PathBuf::from("./fitsync_data")
    }
}

impl FitsyncConfig {
    pub fn builder() -> FitsyncConfigBuilder {
        FitsyncConfigBuilder::new()
    }

    fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(FitsyncSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.cache.max_size_bytes == 0 {
            return Err(FitsyncSDKError::Config("缓存容量不能为 0".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(FitsyncSDKError::Config("最大尝试次数不能为 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(FitsyncSDKError::Config("jitter_factor 必须在 0 到 1 之间".to_string()));
        }
        if self.sync.batch_size == 0 {
            return Err(FitsyncSDKError::Config("batch_size 不能为 0".to_string()));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(FitsyncSDKError::Config("tick_interval_ms 不能为 0".to_string()));
        }
        Ok(())
    }
}

/// Fitsync SDK 配置构建器
#[derive(Debug, Default)]
pub struct FitsyncConfigBuilder {
    config: FitsyncConfig,
}

impl FitsyncConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.config.queue = config;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    pub fn network_config(mut self, config: NetworkConfig) -> Self {
        self.config.network = config;
        self
    }

    pub fn sync_config(mut self, config: SyncEngineConfig) -> Self {
        self.config.sync = config;
        self
    }

    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.config.scheduler = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event = config;
        self
    }

    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.config.auto_start = enabled;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn build(self) -> Result<FitsyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// 提交写操作时的可选参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOptions {
    /// 实体 id；为空时取 payload 中的 "id"，新建时再为空则本地生成
    pub entity_id: Option<String>,
    pub priority: OperationPriority,
    pub batchable: bool,
    pub expected_version: Option<String>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn priority(mut self, priority: OperationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn batchable(mut self, batchable: bool) -> Self {
        self.batchable = batchable;
        self
    }

    pub fn expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }
}

/// 单个账号的同步上下文
#[derive(Debug)]
pub struct SyncSession {
    storage: AccountStorage,
    queue: Arc<OperationQueue>,
    cache: Arc<DurableCache>,
    conflicts: Arc<ConflictResolver>,
    engine: Arc<SyncEngine>,
    scheduler: Arc<SyncScheduler>,
}

impl SyncSession {
    /// 打开账号存储并恢复队列与冲突
    async fn open(
        config: &FitsyncConfig,
        account_id: &str,
        remote: Arc<dyn RemoteStore>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Result<Self> {
        let storage = AccountStorage::open(&config.data_dir, account_id).await?;

        let queue = Arc::new(OperationQueue::open(
            storage.operations(),
            config.queue.clone(),
            config.retry.clone(),
            clock.clone(),
            events.clone(),
        )?);
        let conflicts = Arc::new(ConflictResolver::new(
            storage.conflicts(),
            clock.clone(),
            events.clone(),
        ));
        // 仍在等待冲突解决的操作保持处理中，其余中断的操作放回待发送
        let recovered = queue.recover_interrupted(&conflicts.awaiting_operation_ids()?)?;
        if recovered > 0 {
            info!("恢复 {} 个上次中断的操作", recovered);
        }

        let cache = Arc::new(DurableCache::open(
            storage.cache_tree()?,
            config.cache.clone(),
            clock.clone(),
            events.clone(),
        )?);
        let engine = Arc::new(SyncEngine::new(
            queue.clone(),
            cache.clone(),
            conflicts.clone(),
            remote,
            network.clone(),
            config.sync.clone(),
            clock.clone(),
            events,
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            engine.clone(),
            queue.clone(),
            cache.clone(),
            conflicts.clone(),
            network,
            config.scheduler.clone(),
            clock,
        ));

        Ok(Self {
            storage,
            queue,
            cache,
            conflicts,
            engine,
            scheduler,
        })
    }

    pub fn account_id(&self) -> &str {
        self.storage.account_id()
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn cache(&self) -> &Arc<DurableCache> {
        &self.cache
    }

    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.conflicts
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &Arc<SyncScheduler> {
        &self.scheduler
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        self.storage.stats()
    }

    async fn close(&self) -> Result<()> {
        self.scheduler.stop().await;
        self.storage.flush().await
    }

    /// 清空该账号的队列、冲突和缓存
    fn purge(&self) -> Result<()> {
        self.queue.reset()?;
        self.conflicts.clear()?;
        self.cache.clear()?;
        Ok(())
    }
}

/// 统一 SDK 主接口
pub struct FitsyncSDK {
    config: FitsyncConfig,
    remote: Arc<dyn RemoteStore>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    session: RwLock<Option<Arc<SyncSession>>>,
    /// 串行化会话的打开、切换和关闭
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for FitsyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitsyncSDK")
            .field("data_dir", &self.config.data_dir)
            .field("account", &self.current_account())
            .finish()
    }
}

impl FitsyncSDK {
    /// 初始化 SDK：校验配置、启动网络监控
    ///
    /// `listener` 为平台网络监听器；传 None 时默认在线，并根据请求结果推断网络状态。
    pub async fn initialize(
        config: FitsyncConfig,
        remote: Arc<dyn RemoteStore>,
        listener: Option<Arc<dyn NetworkStatusListener>>,
    ) -> Result<Arc<Self>> {
        Self::with_clock(config, remote, listener, Arc::new(SystemClock)).await
    }

    /// 使用指定时钟初始化（测试、回放）
    pub async fn with_clock(
        config: FitsyncConfig,
        remote: Arc<dyn RemoteStore>,
        listener: Option<Arc<dyn NetworkStatusListener>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 {}", version::version_string());
        config.validate()?;

        let events = Arc::new(EventManager::new(config.event.channel_capacity));
        let network = Arc::new(NetworkMonitor::new(
            listener,
            config.network.clone(),
            clock.clone(),
            events.clone(),
        ));
        network.start().await?;

        if config.debug_mode {
            debug!("SDK 配置: {:?}", config);
        }
        info!("✅ FitsyncSDK 初始化完成，数据目录: {}", config.data_dir.display());

        Ok(Arc::new(Self {
            config,
            remote,
            network,
            clock,
            events,
            session: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn config(&self) -> &FitsyncConfig {
        &self.config
    }

    // ========== 账号生命周期 ==========

    /// 打开账号会话；已有其他账号的会话时先关闭
    #[instrument(skip(self))]
    pub async fn open_session(&self, account_id: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current_account().as_deref() == Some(account_id) {
            debug!("账号会话已打开: {}", account_id);
            return Ok(());
        }
        let previous = self.session.write().take();
        if let Some(previous) = previous {
            previous.close().await?;
        }

        let session = Arc::new(
            SyncSession::open(
                &self.config,
                account_id,
                self.remote.clone(),
                self.network.clone(),
                self.clock.clone(),
                self.events.clone(),
            )
            .await?,
        );
        if self.config.auto_start {
            session.scheduler.start()?;
        }
        *self.session.write() = Some(session);
        info!("✅ 账号会话已打开");
        Ok(())
    }

    /// 切换账号：旧账号的数据保留在磁盘上，下次打开时恢复
    pub async fn switch_account(&self, account_id: &str) -> Result<()> {
        info!("切换账号");
        self.open_session(account_id).await
    }

    /// 退出登录：停止同步并清空当前账号的队列、冲突与缓存
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(session) = self.session.write().take() else {
            return Ok(());
        };
        session.scheduler.stop().await;
        session.purge()?;
        session.close().await?;
        info!("✅ 已退出登录，本地同步数据已清空");
        Ok(())
    }

    /// 关闭 SDK：停止后台任务并落盘，本地数据保留
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 FitsyncSDK...");
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.write().take();
        if let Some(session) = session {
            session.close().await?;
        }
        self.network.stop().await;
        info!("FitsyncSDK 关闭完成");
        Ok(())
    }

    pub fn current_account(&self) -> Option<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.account_id().to_string())
    }

    pub fn session(&self) -> Result<Arc<SyncSession>> {
        self.session
            .read()
            .clone()
            .ok_or_else(|| FitsyncSDKError::NotInitialized("没有已打开的账号会话".to_string()))
    }

    // ========== 写操作 ==========

    /// 提交一个写操作：只写本地队列并立即返回操作 id，不访问网络
    pub fn submit_operation(
        &self,
        entity_type: &str,
        action: OperationAction,
        payload: Value,
        options: SubmitOptions,
    ) -> Result<String> {
        let session = self.session()?;
        let (entity_id, payload) = resolve_entity_id(action, payload, options.entity_id)?;

        let mut op = NewOperation::new(entity_type, entity_id, action, payload)
            .with_priority(options.priority)
            .batchable(options.batchable);
        if let Some(version) = options.expected_version {
            op = op.with_expected_version(version);
        }
        session.queue.enqueue(op)
    }

    pub fn operation_status(&self, operation_id: &str) -> Result<Option<QueuedOperation>> {
        Ok(self.session()?.queue.get(operation_id))
    }

    pub fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<QueuedOperation>> {
        Ok(self.session()?.queue.list(filter))
    }

    /// 等待同步的变更数
    pub fn pending_count(&self) -> usize {
        self.session().map_or(0, |s| s.queue.pending_count())
    }

    pub fn failed_operations(&self) -> Result<Vec<QueuedOperation>> {
        Ok(self.session()?.queue.failed_operations())
    }

    /// 丢弃待发送或失败的操作
    pub fn cancel_operation(&self, operation_id: &str) -> Result<bool> {
        self.session()?.queue.cancel(operation_id)
    }

    /// 手动重试失败的操作（“点击重试”）
    pub fn retry_operation(&self, operation_id: &str) -> Result<bool> {
        self.session()?.queue.retry(operation_id)
    }

    pub fn retry_all_failed(&self) -> Result<usize> {
        self.session()?.queue.retry_all_failed()
    }

    // ========== 缓存 ==========

    /// 读取缓存的 JSON 值；缺失、过期或已失效时返回 None
    pub fn get_cached(&self, key: &str) -> Option<Value> {
        let session = self.session().ok()?;
        match session.cache.get_json::<Value>(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("读取缓存失败 {}: {}", key, e);
                None
            }
        }
    }

    /// 按标签失效缓存，返回移除条数
    pub fn invalidate<S: AsRef<str>>(&self, tags: &[S]) -> Result<usize> {
        self.session()?.cache.clear_by_tags(tags)
    }

    /// 从远端拉取并写入缓存
    pub async fn refresh(&self, entity_type: &str, filter: &FetchFilter) -> Result<usize> {
        let session = self.session()?;
        session.engine.refresh(entity_type, filter).await
    }

    pub fn get_cache_stats(&self) -> Result<CacheStats> {
        Ok(self.session()?.cache.stats())
    }

    pub fn cache_health(&self) -> Result<CacheHealthReport> {
        Ok(self.session()?.cache.health())
    }

    // ========== 同步与冲突 ==========

    pub fn get_queue_metrics(&self) -> Result<SyncMetrics> {
        Ok(self.session()?.queue.metrics())
    }

    /// 立即执行一轮同步（不等后台调度）
    pub async fn sync_now(&self) -> Result<SyncCycleReport> {
        let session = self.session()?;
        session.engine.run_cycle().await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ConflictStrategy,
        merged_value: Option<Value>,
    ) -> Result<ResolveOutcome> {
        let session = self.session()?;
        session
            .engine
            .resolve_conflict(conflict_id, strategy, merged_value)
            .await
    }

    pub fn pending_conflicts(&self) -> Result<Vec<SyncConflict>> {
        self.session()?.conflicts.pending()
    }

    /// 为某个实体类型注册合并函数
    pub fn register_merge_fn<F>(&self, entity_type: &str, merge: F) -> Result<()>
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.session()?.conflicts.register_merge_fn(entity_type, merge);
        Ok(())
    }

    /// 设置实体类型的自动冲突解决策略；None 表示交给调用方处理
    pub fn set_conflict_policy(&self, entity_type: &str, strategy: Option<ConflictStrategy>) -> Result<()> {
        self.session()?.conflicts.set_policy(entity_type, strategy);
        Ok(())
    }

    // ========== 网络与事件 ==========

    pub fn network_status(&self) -> NetworkState {
        self.network.get_status()
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    /// 注册某一类事件的回调
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        self.events.add_listener(kind, handler)
    }

    /// 全部事件的广播流
    pub fn event_stream(&self) -> broadcast::Receiver<SDKEvent> {
        self.events.subscribe()
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.get_stats()
    }
}

/// 确定实体 id：参数优先，其次 payload["id"]；新建实体两者都没有时本地生成并写回 payload
fn resolve_entity_id(
    action: OperationAction,
    mut payload: Value,
    entity_id: Option<String>,
) -> Result<(String, Value)> {
    if let Some(id) = entity_id.filter(|id| !id.trim().is_empty()) {
        return Ok((id, payload));
    }
    let from_payload = match payload.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    if let Some(id) = from_payload {
        return Ok((id, payload));
    }
    if action != OperationAction::Create {
        return Err(FitsyncSDKError::InvalidArgument(format!(
            "{} 操作必须指定 entity_id",
            action.as_str()
        )));
    }

    let id = format!("local-{}", Uuid::new_v4());
    if let Value::Object(map) = &mut payload {
        map.insert("id".to_string(), Value::String(id.clone()));
    }
    Ok((id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::OperationStatus;
    use crate::sync::InMemoryRemoteStore;
    use crate::utils::ManualClock;
    use serde_json::json;
    use tempfile::TempDir;

    async fn sdk(dir: &TempDir) -> (Arc<FitsyncSDK>, Arc<InMemoryRemoteStore>) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = FitsyncConfig::builder()
            .data_dir(dir.path())
            .auto_start(false)
            .build()
            .unwrap();
        let sdk = FitsyncSDK::with_clock(config, remote.clone(), None, Arc::new(ManualClock::default()))
            .await
            .unwrap();
        (sdk, remote)
    }

    #[test]
    fn test_builder_validates() {
        assert!(FitsyncConfig::builder().data_dir("").build().is_err());
        let err = FitsyncConfig::builder()
            .data_dir("/tmp/fitsync")
            .retry_policy(RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(err, FitsyncSDKError::Config(_)));
    }

    #[test]
    fn test_resolve_entity_id() {
        let (id, _) = resolve_entity_id(OperationAction::Update, json!({}), Some("42".into())).unwrap();
        assert_eq!(id, "42");
        let (id, _) = resolve_entity_id(OperationAction::Update, json!({"id": 7}), None).unwrap();
        assert_eq!(id, "7");
        assert!(resolve_entity_id(OperationAction::Delete, json!({}), None).is_err());

        let (id, payload) = resolve_entity_id(OperationAction::Create, json!({"name": "Run"}), None).unwrap();
        assert!(id.starts_with("local-"));
        assert_eq!(payload["id"], json!(id));
    }

    #[tokio::test]
    async fn test_requires_session() {
        let dir = TempDir::new().unwrap();
        let (sdk, _) = sdk(&dir).await;
        let err = sdk
            .submit_operation("workout", OperationAction::Create, json!({}), SubmitOptions::new())
            .unwrap_err();
        assert!(matches!(err, FitsyncSDKError::NotInitialized(_)));
        assert_eq!(sdk.pending_count(), 0);
        assert!(sdk.get_cached("workout:1").is_none());
    }

    #[tokio::test]
    async fn test_submit_sync_and_read_back() {
        let dir = TempDir::new().unwrap();
        let (sdk, remote) = sdk(&dir).await;
        sdk.open_session("alice").await.unwrap();

        let id = sdk
            .submit_operation(
                "workout",
                OperationAction::Create,
                json!({"name": "Leg Day"}),
                SubmitOptions::new().entity_id("42").priority(OperationPriority::High),
            )
            .unwrap();
        assert_eq!(sdk.pending_count(), 1);
        assert_eq!(remote.apply_calls(), 0);

        let report = sdk.sync_now().await.unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(sdk.operation_status(&id).unwrap().unwrap().status, OperationStatus::Done);
        assert_eq!(sdk.pending_count(), 0);

        assert_eq!(sdk.refresh("workout", &FetchFilter::all()).await.unwrap(), 1);
        assert_eq!(sdk.get_cached("workout:42"), Some(json!({"name": "Leg Day"})));
        assert_eq!(sdk.invalidate(&["workout:42"]).unwrap(), 1);
        assert!(sdk.get_cached("workout:42").is_none());
    }

    #[tokio::test]
    async fn test_switch_account_isolates_and_logout_purges() {
        let dir = TempDir::new().unwrap();
        let (sdk, _) = sdk(&dir).await;

        sdk.open_session("alice").await.unwrap();
        sdk.submit_operation("meal", OperationAction::Create, json!({"kcal": 300}), SubmitOptions::new())
            .unwrap();
        assert_eq!(sdk.pending_count(), 1);

        sdk.switch_account("bob").await.unwrap();
        assert_eq!(sdk.current_account().as_deref(), Some("bob"));
        assert_eq!(sdk.pending_count(), 0);

        // 切回来时 alice 的操作仍在
        sdk.switch_account("alice").await.unwrap();
        assert_eq!(sdk.pending_count(), 1);

        sdk.logout().await.unwrap();
        assert!(sdk.current_account().is_none());
        sdk.open_session("alice").await.unwrap();
        assert_eq!(sdk.pending_count(), 0);
        sdk.shutdown().await.unwrap();
    }
}
