use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::priority::OperationPriority;
use super::retry_policy::SyncFailureReason;
use crate::error::{FitsyncSDKError, Result};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationAction {
    Create,
    Update,
    Delete,
}

impl OperationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Create => "create",
            OperationAction::Update => "update",
            OperationAction::Delete => "delete",
        }
    }
}

impl std::str::FromStr for OperationAction {
    type Err = FitsyncSDKError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationAction::Create),
            "update" => Ok(OperationAction::Update),
            "delete" => Ok(OperationAction::Delete),
            other => Err(FitsyncSDKError::InvalidArgument(format!("未知操作类型: {}", other))),
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 操作状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    /// 等待发送
    Pending,
    /// 已被某个批次认领，正在发送或等待冲突解决
    Processing,
    /// 发送失败（等待重试或永久失败）
    Failed,
    /// 已被远端接受
    Done,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Failed => "failed",
            OperationStatus::Done => "done",
        }
    }
}

impl std::str::FromStr for OperationStatus {
    type Err = FitsyncSDKError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "failed" => Ok(OperationStatus::Failed),
            "done" => Ok(OperationStatus::Done),
            other => Err(FitsyncSDKError::InvalidArgument(format!("未知操作状态: {}", other))),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Pending => "待发送",
            OperationStatus::Processing => "处理中",
            OperationStatus::Failed => "失败",
            OperationStatus::Done => "已完成",
        };
        write!(f, "{}", s)
    }
}

/// 调用方提交的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOperation {
    pub entity_type: String,
    /// 实体自然键；新建且尚未同步的实体使用本地生成的 id
    pub entity_id: String,
    pub action: OperationAction,
    pub payload: Value,
    pub priority: OperationPriority,
    /// 允许与同一实体短时间内的相邻操作合并
    pub batchable: bool,
    /// 乐观并发校验使用的版本号
    pub expected_version: Option<String>,
}

impl NewOperation {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: OperationAction,
        payload: Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action,
            payload,
            priority: OperationPriority::default(),
            batchable: false,
            expected_version: None,
        }
    }

    pub fn with_priority(mut self, priority: OperationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn batchable(mut self, batchable: bool) -> Self {
        self.batchable = batchable;
        self
    }

    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = Some(version.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(FitsyncSDKError::InvalidArgument("entity_type 不能为空".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(FitsyncSDKError::InvalidArgument("entity_id 不能为空".into()));
        }
        Ok(())
    }
}

/// 实体自然键：entity_type + entity_id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    /// 该实体在缓存中的标签
    pub fn tag(&self) -> String {
        format!("{}:{}", self.entity_type, self.entity_id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// 队列中的操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// 操作 id，重试期间保持不变
    pub id: String,
    /// 提交序号
    pub seq: u64,
    pub entity_type: String,
    pub entity_id: String,
    pub action: OperationAction,
    pub payload: Value,
    pub priority: OperationPriority,
    pub status: OperationStatus,
    /// 失败传输次数，只增不减
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_failure_reason: Option<SyncFailureReason>,
    pub batchable: bool,
    pub expected_version: Option<String>,
    pub next_attempt_at: Option<i64>,
    pub permanent_failure: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub processing_started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl QueuedOperation {
    pub fn from_new(op: NewOperation, id: String, seq: u64, now: i64) -> Self {
        Self {
            id,
            seq,
            entity_type: op.entity_type,
            entity_id: op.entity_id,
            action: op.action,
            payload: op.payload,
            priority: op.priority,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            last_failure_reason: None,
            batchable: op.batchable,
            expected_version: op.expected_version,
            next_attempt_at: None,
            permanent_failure: false,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
        }
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }

    pub fn is_finished(&self) -> bool {
        self.status == OperationStatus::Done
    }

    /// 当前是否可以被出队
    pub fn is_dispatchable(&self, now: i64) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => {
                !self.permanent_failure && self.next_attempt_at.map_or(true, |t| t <= now)
            }
            OperationStatus::Processing | OperationStatus::Done => false,
        }
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.status == OperationStatus::Failed && self.permanent_failure
    }

    pub fn mark_processing(&mut self, now: i64) {
        self.status = OperationStatus::Processing;
        self.processing_started_at = Some(now);
        self.updated_at = now;
    }

    pub fn mark_done(&mut self, now: i64) {
        self.status = OperationStatus::Done;
        self.completed_at = Some(now);
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    pub fn mark_failed(
        &mut self,
        error: &str,
        reason: SyncFailureReason,
        next_attempt_at: Option<i64>,
        now: i64,
    ) {
        self.status = OperationStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.last_failure_reason = Some(reason);
        self.next_attempt_at = next_attempt_at;
        self.permanent_failure = next_attempt_at.is_none();
        self.processing_started_at = None;
        self.updated_at = now;
    }

    /// 回到待发送，不计失败次数
    pub fn release(&mut self, now: i64) {
        self.status = OperationStatus::Pending;
        self.processing_started_at = None;
        self.updated_at = now;
    }

    /// 人工重试：清除永久失败标记，立即可出队
    pub fn reset_for_retry(&mut self, now: i64) {
        self.status = OperationStatus::Pending;
        self.permanent_failure = false;
        self.next_attempt_at = None;
        self.updated_at = now;
    }

    /// 本次处理耗时
    pub fn processing_latency_ms(&self, now: i64) -> Option<u64> {
        self.processing_started_at.map(|t| (now - t).max(0) as u64)
    }
}

/// 队列查询条件
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status: Option<OperationStatus>,
    pub priority: Option<OperationPriority>,
    pub permanent_only: bool,
}

impl OperationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn status(mut self, status: OperationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: OperationPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn permanent_only(mut self) -> Self {
        self.permanent_only = true;
        self
    }

    pub fn matches(&self, op: &QueuedOperation) -> bool {
        self.entity_type.as_ref().map_or(true, |t| &op.entity_type == t)
            && self.entity_id.as_ref().map_or(true, |id| &op.entity_id == id)
            && self.status.map_or(true, |s| op.status == s)
            && self.priority.map_or(true, |p| op.priority == p)
            && (!self.permanent_only || op.is_permanent_failure())
    }
}
