//! Fitsync SDK - 离线优先的健身数据同步核心
//!
//! 本 SDK 负责把应用里的写操作可靠地同步到后端，包括：
//! - 📥 持久化操作队列：优先级、同实体顺序、合并、指数退避重试
//! - 💾 持久化缓存：TTL、按标签失效、LRU 淘汰、健康检查
//! - 📡 网络状态监控：平台信号或请求结果推断，稳定窗口后才恢复同步
//! - 🔄 同步引擎与后台调度
//! - ⚔️ 冲突解决：保留本地 / 采用远端 / 合并，可按实体类型自动处理
//! - ⚙️ 事件系统：指标、网络、冲突、操作状态的订阅
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fitsync_sdk::{FitsyncConfig, FitsyncSDK, InMemoryRemoteStore, OperationAction, SubmitOptions};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FitsyncConfig::builder().data_dir("/path/to/data").build()?;
//!     let sdk = FitsyncSDK::initialize(config, Arc::new(InMemoryRemoteStore::new()), None).await?;
//!     sdk.open_session("user-123").await?;
//!
//!     // 离线时也立即返回，联网后后台同步
//!     let op_id = sdk.submit_operation(
//!         "workout",
//!         OperationAction::Create,
//!         json!({ "name": "Leg Day", "sets": 4 }),
//!         SubmitOptions::new(),
//!     )?;
//!     println!("已入队: {}", op_id);
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod network;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use cache::{
    CacheConfig, CacheHealthReport, CacheSetOptions, CacheStats, DurableCache, HealthStatus,
};
pub use error::{ErrorClass, FitsyncSDKError, Result};
pub use events::{EventKind, EventManager, EventStats, SDKEvent, Subscription};
pub use network::{
    NetworkConfig, NetworkMonitor, NetworkQuality, NetworkState, NetworkStatusListener,
    NetworkTransition, PlatformSignal,
};
pub use sdk::{EventConfig, FitsyncConfig, FitsyncConfigBuilder, FitsyncSDK, SubmitOptions, SyncSession};
pub use storage::queue::{
    OperationAction, OperationFilter, OperationPriority, OperationQueue, OperationStatus,
    QueueConfig, QueuedOperation, RetryPolicy, SyncFailureReason, SyncMetrics,
};
pub use sync::{
    ApplyOutcome, ConflictResolution, ConflictStrategy, FetchFilter, InMemoryRemoteStore,
    RemoteRecord, RemoteStore, ResolveOutcome, SchedulerConfig, SyncConflict, SyncCycleReport,
    SyncEngineConfig,
};
pub use utils::{Clock, ManualClock, SystemClock};
pub use version::{SDK_DB_VERSION, SDK_VERSION};

#[cfg(test)]
mod scenario_tests;
