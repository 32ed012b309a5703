//! 冲突解决
//!
//! 远端报告版本不匹配时生成 `SyncConflict` 并落盘，对应的操作保持处理中，
//! 直到调用方（或按实体类型配置的自动策略）给出解决方式：
//!
//! - `KeepLocal`：以远端版本号重新提交本地负载
//! - `KeepRemote`：采用远端记录写入缓存，移除排队的操作
//! - `Merge`：调用方提供合并结果，或使用注册的合并函数；两者都没有时冲突保持待处理
//!
//! 同一冲突只会被解决一次，重复调用返回已保存的结果。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FitsyncSDKError, Result};
use crate::events::{EventManager, SDKEvent};
use crate::storage::queue::QueuedOperation;
use crate::storage::ConflictStore;
use crate::utils::Clock;

/// 解决策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    KeepLocal,
    KeepRemote,
    Merge,
}

/// 冲突的解决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    Pending,
    Local,
    Remote,
    Merged,
}

impl ConflictResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::Pending => "pending",
            ConflictResolution::Local => "local",
            ConflictResolution::Remote => "remote",
            ConflictResolution::Merged => "merged",
        }
    }
}

impl std::str::FromStr for ConflictResolution {
    type Err = FitsyncSDKError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ConflictResolution::Pending),
            "local" => Ok(ConflictResolution::Local),
            "remote" => Ok(ConflictResolution::Remote),
            "merged" => Ok(ConflictResolution::Merged),
            other => Err(FitsyncSDKError::InvalidArgument(format!(
                "未知冲突解决结果: {}",
                other
            ))),
        }
    }
}

impl From<ConflictStrategy> for ConflictResolution {
    fn from(strategy: ConflictStrategy) -> Self {
        match strategy {
            ConflictStrategy::KeepLocal => ConflictResolution::Local,
            ConflictStrategy::KeepRemote => ConflictResolution::Remote,
            ConflictStrategy::Merge => ConflictResolution::Merged,
        }
    }
}

/// 本地与远端版本的冲突
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub operation_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub local_version: Value,
    pub remote_version: Value,
    /// 远端当前版本号，保留本地时随重新提交一起发送
    pub remote_version_token: String,
    pub detected_at: i64,
    pub resolution: ConflictResolution,
    pub resolved_record: Option<Value>,
    pub resolved_at: Option<i64>,
}

impl SyncConflict {
    pub fn is_resolved(&self) -> bool {
        self.resolution != ConflictResolution::Pending
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("冲突 {0} 不存在")]
    NotFound(String),
    #[error("实体类型 {0} 没有注册合并函数，也没有提供合并结果")]
    MergeUnavailable(String),
    #[error("合并函数执行失败: {0}")]
    MergeFailed(String),
}

impl From<ConflictError> for FitsyncSDKError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::NotFound(_) => FitsyncSDKError::NotFound(err.to_string()),
            ConflictError::MergeUnavailable(_) => FitsyncSDKError::InvalidOperation(err.to_string()),
            ConflictError::MergeFailed(_) => FitsyncSDKError::Conflict(err.to_string()),
        }
    }
}

/// 合并函数：(本地, 远端) -> 合并结果
pub type MergeFn = Arc<dyn Fn(&Value, &Value) -> Result<Value> + Send + Sync>;

/// 解决方式确定后需要执行的动作
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    /// 以远端版本号重新提交
    Resubmit {
        payload: Value,
        expected_version: String,
        resolution: ConflictResolution,
    },
    /// 采用远端记录
    AdoptRemote { record: Value },
}

/// 冲突解决器：登记、持久化、策略与合并函数
pub struct ConflictResolver {
    store: ConflictStore,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    merge_fns: RwLock<HashMap<String, MergeFn>>,
    policies: RwLock<HashMap<String, ConflictStrategy>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("merge_fns", &self.merge_fns.read().keys().collect::<Vec<_>>())
            .field("policies", &*self.policies.read())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(store: ConflictStore, clock: Arc<dyn Clock>, events: Arc<EventManager>) -> Self {
        Self {
            store,
            clock,
            events,
            merge_fns: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
        }
    }

    /// 登记远端报告的版本冲突
    pub fn register(
        &self,
        op: &QueuedOperation,
        current_version: String,
        remote_record: Value,
    ) -> Result<SyncConflict> {
        let now = self.clock.now_ms();
        let conflict = SyncConflict {
            id: Uuid::new_v4().to_string(),
            operation_id: op.id.clone(),
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            local_version: op.payload.clone(),
            remote_version: remote_record,
            remote_version_token: current_version,
            detected_at: now,
            resolution: ConflictResolution::Pending,
            resolved_record: None,
            resolved_at: None,
        };
        self.store.upsert(&conflict)?;

        warn!(
            "检测到版本冲突 {}: {} 操作 {}，远端版本 {}",
            conflict.id,
            op.entity_key(),
            op.id,
            conflict.remote_version_token
        );
        self.events.emit(SDKEvent::ConflictDetected {
            conflict_id: conflict.id.clone(),
            operation_id: conflict.operation_id.clone(),
            entity_type: conflict.entity_type.clone(),
            entity_id: conflict.entity_id.clone(),
            timestamp: now,
        });
        Ok(conflict)
    }

    pub fn get(&self, conflict_id: &str) -> Result<SyncConflict> {
        self.store
            .get(conflict_id)?
            .ok_or_else(|| ConflictError::NotFound(conflict_id.to_string()).into())
    }

    pub fn pending(&self) -> Result<Vec<SyncConflict>> {
        self.store.list_pending()
    }

    /// 正在等待冲突解决的操作
    pub fn awaiting_operation_ids(&self) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_pending()?
            .into_iter()
            .map(|c| c.operation_id)
            .collect())
    }

    pub fn register_merge_fn<F>(&self, entity_type: impl Into<String>, merge: F)
    where
        F: Fn(&Value, &Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.merge_fns
            .write()
            .insert(entity_type.into(), Arc::new(merge));
    }

    /// 设置某个实体类型的自动解决策略
    pub fn set_policy(&self, entity_type: impl Into<String>, strategy: Option<ConflictStrategy>) {
        let entity_type = entity_type.into();
        let mut policies = self.policies.write();
        match strategy {
            Some(strategy) => {
                policies.insert(entity_type, strategy);
            }
            None => {
                policies.remove(&entity_type);
            }
        }
    }

    pub fn policy_for(&self, entity_type: &str) -> Option<ConflictStrategy> {
        self.policies.read().get(entity_type).copied()
    }

    /// 根据策略决定要执行的动作
    pub fn plan(
        &self,
        conflict: &SyncConflict,
        strategy: ConflictStrategy,
        merged_value: Option<Value>,
    ) -> Result<ResolutionPlan> {
        match strategy {
            ConflictStrategy::KeepLocal => Ok(ResolutionPlan::Resubmit {
                payload: conflict.local_version.clone(),
                expected_version: conflict.remote_version_token.clone(),
                resolution: ConflictResolution::Local,
            }),
            ConflictStrategy::KeepRemote => Ok(ResolutionPlan::AdoptRemote {
                record: conflict.remote_version.clone(),
            }),
            ConflictStrategy::Merge => {
                let merged = match merged_value {
                    Some(value) => value,
                    None => {
                        let merge = self
                            .merge_fns
                            .read()
                            .get(&conflict.entity_type)
                            .cloned()
                            .ok_or_else(|| ConflictError::MergeUnavailable(conflict.entity_type.clone()))?;
                        merge(&conflict.local_version, &conflict.remote_version)
                            .map_err(|e| ConflictError::MergeFailed(e.to_string()))?
                    }
                };
                Ok(ResolutionPlan::Resubmit {
                    payload: merged,
                    expected_version: conflict.remote_version_token.clone(),
                    resolution: ConflictResolution::Merged,
                })
            }
        }
    }

    /// 记录解决结果并发布事件
    pub fn record_resolution(
        &self,
        mut conflict: SyncConflict,
        resolution: ConflictResolution,
        record: Value,
    ) -> Result<SyncConflict> {
        let now = self.clock.now_ms();
        conflict.resolution = resolution;
        conflict.resolved_record = Some(record);
        conflict.resolved_at = Some(now);
        self.store.upsert(&conflict)?;

        info!(
            "✅ 冲突已解决 {}: {}:{} -> {}",
            conflict.id,
            conflict.entity_type,
            conflict.entity_id,
            resolution.as_str()
        );
        self.events.emit(SDKEvent::ConflictResolved {
            conflict_id: conflict.id.clone(),
            operation_id: conflict.operation_id.clone(),
            resolution,
            timestamp: now,
        });
        Ok(conflict)
    }

    /// 清理保留期之前解决的冲突
    pub fn compact(&self, retention_ms: u64) -> Result<usize> {
        let before = self.clock.now_ms() - retention_ms as i64;
        self.store.prune_resolved(before)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }
}
