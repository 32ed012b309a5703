use serde::{Deserialize, Serialize};
use std::fmt;

/// 操作优先级
///
/// 同一优先级内按提交顺序出队；同一实体的操作无论优先级如何都保持提交顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum OperationPriority {
    High = 0,
    Medium = 1,
    Low = 2,
}

impl OperationPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            0 => Some(OperationPriority::High),
            1 => Some(OperationPriority::Medium),
            2 => Some(OperationPriority::Low),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OperationPriority::High => "high",
            OperationPriority::Medium => "medium",
            OperationPriority::Low => "low",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            OperationPriority::High => "高",
            OperationPriority::Medium => "中",
            OperationPriority::Low => "低",
        }
    }

    /// 单次传输超时（毫秒）
    pub fn timeout_ms(&self) -> u64 {
        match self {
            OperationPriority::High => 10_000,
            OperationPriority::Medium => 30_000,
            OperationPriority::Low => 60_000,
        }
    }

    /// 等待过久的操作逐级提升，用于出队排序（老化），返回提升后的数值
    pub fn aged_value(&self, waited_ms: i64, aging_interval_ms: Option<u64>) -> u8 {
        match aging_interval_ms {
            Some(interval) if interval > 0 && waited_ms > 0 => {
                let steps = (waited_ms as u64 / interval).min(u8::MAX as u64) as u8;
                self.value().saturating_sub(steps)
            }
            _ => self.value(),
        }
    }
}

impl fmt::Display for OperationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

impl Default for OperationPriority {
    fn default() -> Self {
        OperationPriority::Medium
    }
}

impl std::str::FromStr for OperationPriority {
    type Err = crate::error::FitsyncSDKError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(OperationPriority::High),
            "medium" => Ok(OperationPriority::Medium),
            "low" => Ok(OperationPriority::Low),
            other => Err(crate::error::FitsyncSDKError::InvalidArgument(format!(
                "未知优先级: {}",
                other
            ))),
        }
    }
}
