use serde::{Deserialize, Serialize};

use crate::error::FitsyncSDKError;

/// 同步失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncFailureReason {
    /// 传输超时 - 可重试
    NetworkTimeout,
    /// 网络不可用 - 可重试
    NetworkUnavailable,
    /// 服务端错误 - 5xx 重试，4xx 不重试
    ServerError(u16),
    /// 限流 - 可重试
    RateLimited,
    /// 服务端校验拒绝 - 永不自动重试
    Validation(String),
    /// 本地存储故障 - 对该操作致命
    Storage(String),
    /// 未知错误 - 保守起见按可重试处理
    Unknown(String),
}

impl SyncFailureReason {
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncFailureReason::NetworkTimeout => true,
            SyncFailureReason::NetworkUnavailable => true,
            SyncFailureReason::ServerError(code) => (500..600).contains(code),
            SyncFailureReason::RateLimited => true,
            SyncFailureReason::Validation(_) => false,
            SyncFailureReason::Storage(_) => false,
            SyncFailureReason::Unknown(_) => true,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncFailureReason::NetworkTimeout
                | SyncFailureReason::NetworkUnavailable
                | SyncFailureReason::ServerError(_)
                | SyncFailureReason::RateLimited
        )
    }
}

impl From<&FitsyncSDKError> for SyncFailureReason {
    fn from(error: &FitsyncSDKError) -> Self {
        match error {
            FitsyncSDKError::Timeout(_) => SyncFailureReason::NetworkTimeout,
            FitsyncSDKError::TransientNetwork(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("timeout") {
                    SyncFailureReason::NetworkTimeout
                } else if lower.contains("rate") && lower.contains("limit") {
                    SyncFailureReason::RateLimited
                } else if let Some(code) = parse_status_code(&lower) {
                    SyncFailureReason::ServerError(code)
                } else {
                    SyncFailureReason::NetworkUnavailable
                }
            }
            FitsyncSDKError::Validation(msg) => SyncFailureReason::Validation(msg.clone()),
            e if e.is_storage() => SyncFailureReason::Storage(e.to_string()),
            other => SyncFailureReason::Unknown(other.to_string()),
        }
    }
}

/// 从 "503 service unavailable" 这类消息里取出状态码
fn parse_status_code(msg: &str) -> Option<u16> {
    msg.split(|c: char| !c.is_ascii_digit())
        .filter(|s| s.len() == 3)
        .filter_map(|s| s.parse::<u16>().ok())
        .find(|code| (400..600).contains(code))
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数，达到后转为永久失败
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// 随机抖动比例 (0.0-1.0)，只向后抖动
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// `mark_failed` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureDisposition {
    /// 到 `next_attempt_at` 后可再次出队
    Retry { next_attempt_at: i64 },
    /// 永久失败，等待人工重试或丢弃
    Permanent,
}

impl RetryPolicy {
    /// 第 `retry_index` 次重试前的等待时间（不含抖动）：base * factor^retry_index，封顶 max_delay
    ///
    /// 只由次数决定，与失败原因无关，前后两次失败原因不同时等待时间也不会变短
    pub fn backoff_delay_ms(&self, retry_index: u32) -> u64 {
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powf(retry_index as f64);
        raw.min(self.max_delay_ms as f64).max(0.0) as u64
    }

    fn jitter_ms(&self, delay_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || delay_ms == 0 {
            return 0;
        }
        let span = delay_ms as f64 * self.jitter_factor.min(1.0);
        (span * rand::random::<f64>()) as u64
    }

    pub fn should_retry(&self, attempts: u32, reason: &SyncFailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }

    /// `attempts` 为本次失败计入后的累计次数
    pub fn disposition(
        &self,
        now_ms: i64,
        attempts: u32,
        reason: &SyncFailureReason,
    ) -> FailureDisposition {
        if !self.should_retry(attempts, reason) {
            return FailureDisposition::Permanent;
        }
        let delay = self.backoff_delay_ms(attempts.saturating_sub(1));
        let delay = delay + self.jitter_ms(delay);
        FailureDisposition::Retry {
            next_attempt_at: now_ms + delay as i64,
        }
    }
}
