use serde::{Deserialize, Serialize};

use super::CacheStats;

const DAY_MS: i64 = 24 * 60 * 60 * 1_000;

/// 健康检查阈值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHealthThresholds {
    /// 命中率低于该值为 Warning
    pub warning_hit_rate: f64,
    /// 命中率低于该值为 Critical
    pub critical_hit_rate: f64,
    /// 最老条目超过该年龄为 Warning
    pub max_item_age_ms: i64,
    /// 请求数不足时不评估命中率
    pub min_requests: u64,
}

impl Default for CacheHealthThresholds {
    fn default() -> Self {
        Self {
            warning_hit_rate: 0.7,
            critical_hit_rate: 0.5,
            max_item_age_ms: 60 * DAY_MS,
            min_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthIssue {
    LowHitRate { hit_rate_percent: u32 },
    StaleEntries { oldest_age_days: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheHealthReport {
    pub status: HealthStatus,
    pub issues: Vec<HealthIssue>,
}

impl CacheHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn has_stale_entries(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, HealthIssue::StaleEntries { .. }))
    }
}

/// 根据统计数据给出健康结论
pub fn evaluate(stats: &CacheStats, thresholds: &CacheHealthThresholds) -> CacheHealthReport {
    let mut status = HealthStatus::Healthy;
    let mut issues = Vec::new();

    if stats.hits + stats.misses >= thresholds.min_requests {
        if stats.hit_rate < thresholds.critical_hit_rate {
            status = status.max(HealthStatus::Critical);
        } else if stats.hit_rate < thresholds.warning_hit_rate {
            status = status.max(HealthStatus::Warning);
        }
        if stats.hit_rate < thresholds.warning_hit_rate {
            issues.push(HealthIssue::LowHitRate {
                hit_rate_percent: (stats.hit_rate * 100.0).round() as u32,
            });
        }
    }

    if let Some(age) = stats.oldest_item_age_ms {
        if age > thresholds.max_item_age_ms {
            status = status.max(HealthStatus::Warning);
            issues.push(HealthIssue::StaleEntries {
                oldest_age_days: age / DAY_MS,
            });
        }
    }

    CacheHealthReport { status, issues }
}
