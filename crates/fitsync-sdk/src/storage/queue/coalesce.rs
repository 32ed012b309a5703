//! 入队合并
//!
//! 同一实体在短时间窗口内提交的可合并操作折叠成一个发送单元，
//! 折叠结果与按顺序逐个应用的效果一致。

use serde_json::Value;

use super::operation::{NewOperation, OperationAction, OperationStatus, QueuedOperation};

#[derive(Debug, Clone, PartialEq)]
pub enum CoalesceOutcome {
    /// 不合并，正常入队
    Separate,
    /// 合并为一个操作，占据前一个操作在队列中的位置
    Merged {
        action: OperationAction,
        payload: Value,
        expected_version: Option<String>,
    },
    /// create 后紧跟 delete：两者都不需要发送
    Cancelled,
}

/// 判断 `later` 能否与同一实体上最近一个未完成的操作 `earlier` 合并
pub fn coalesce(
    earlier: &QueuedOperation,
    later: &NewOperation,
    now: i64,
    window_ms: u64,
) -> CoalesceOutcome {
    let mergeable = earlier.batchable
        && later.batchable
        && earlier.entity_type == later.entity_type
        && earlier.entity_id == later.entity_id
        && earlier.status == OperationStatus::Pending
        && earlier.attempts == 0
        && now - earlier.created_at <= window_ms as i64;
    if !mergeable {
        return CoalesceOutcome::Separate;
    }

    let expected_version = earlier
        .expected_version
        .clone()
        .or_else(|| later.expected_version.clone());

    match (earlier.action, later.action) {
        (OperationAction::Create, OperationAction::Update) => CoalesceOutcome::Merged {
            action: OperationAction::Create,
            payload: merge_payload(&earlier.payload, &later.payload),
            expected_version,
        },
        (OperationAction::Create, OperationAction::Delete) => CoalesceOutcome::Cancelled,
        (OperationAction::Update, OperationAction::Update) => CoalesceOutcome::Merged {
            action: OperationAction::Update,
            payload: merge_payload(&earlier.payload, &later.payload),
            expected_version,
        },
        (OperationAction::Update, OperationAction::Delete) => CoalesceOutcome::Merged {
            action: OperationAction::Delete,
            payload: later.payload.clone(),
            expected_version,
        },
        _ => CoalesceOutcome::Separate,
    }
}

/// 浅层字段合并，后写入的字段覆盖先写入的
pub fn merge_payload(earlier: &Value, later: &Value) -> Value {
    match (earlier, later) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => later.clone(),
    }
}
