use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::operation::{OperationStatus, QueuedOperation};

/// 队列指标（派生数据，可随时由队列内容重建）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub pending_count: usize,
    pub processing_count: usize,
    /// 失败总数（包含等待重试与永久失败）
    pub failed_count: usize,
    pub permanent_failure_count: usize,
    pub done_count: usize,
    /// 滑动窗口内的成功率，窗口为空时为 1.0
    pub success_rate: f64,
    /// 滑动窗口内的平均处理耗时
    pub avg_latency_ms: f64,
    pub window_samples: usize,
    /// 按优先级统计的待发送数量
    pub pending_by_priority: BTreeMap<String, usize>,
}

impl SyncMetrics {
    pub fn compute<'a, I>(ops: I, window: &OutcomeWindow) -> Self
    where
        I: IntoIterator<Item = &'a QueuedOperation>,
    {
        let mut metrics = SyncMetrics {
            success_rate: window.success_rate(),
            avg_latency_ms: window.average_latency_ms(),
            window_samples: window.len(),
            ..Default::default()
        };
        for op in ops {
            match op.status {
                OperationStatus::Pending => {
                    metrics.pending_count += 1;
                    *metrics
                        .pending_by_priority
                        .entry(op.priority.name().to_string())
                        .or_insert(0) += 1;
                }
                OperationStatus::Processing => metrics.processing_count += 1,
                OperationStatus::Failed => {
                    metrics.failed_count += 1;
                    if op.permanent_failure {
                        metrics.permanent_failure_count += 1;
                    }
                }
                OperationStatus::Done => metrics.done_count += 1,
            }
        }
        metrics
    }

    /// 还没同步到远端的变更数（"N 条变更等待同步"）
    pub fn unsynced_count(&self) -> usize {
        self.pending_count + self.processing_count + self.failed_count
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    latency_ms: u64,
}

/// 最近 N 次发送结果
#[derive(Debug, Clone)]
pub struct OutcomeWindow {
    capacity: usize,
    samples: VecDeque<Outcome>,
}

impl OutcomeWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, success: bool, latency_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Outcome { success, latency_ms });
    }

    pub fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let ok = self.samples.iter().filter(|s| s.success).count();
        ok as f64 / self.samples.len() as f64
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|s| s.latency_ms).sum();
        total as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::{NewOperation, OperationAction, OperationPriority};
    use serde_json::json;

    #[test]
    fn test_window_rate_and_latency() {
        let mut window = OutcomeWindow::new(3);
        assert_eq!(window.success_rate(), 1.0);

        window.record(true, 100);
        window.record(false, 300);
        window.record(true, 200);
        assert!((window.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((window.average_latency_ms() - 200.0).abs() < 1e-9);

        // 超出容量后最早的样本被挤出
        window.record(true, 400);
        assert_eq!(window.len(), 3);
        assert!((window.success_rate() - 2.0 / 3.0).abs() < 1e-9);
        assert!((window.average_latency_ms() - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_compute_counts() {
        let mut ops = Vec::new();
        for (i, priority) in [OperationPriority::High, OperationPriority::Low, OperationPriority::Low]
            .into_iter()
            .enumerate()
        {
            ops.push(QueuedOperation::from_new(
                NewOperation::new("workout", i.to_string(), OperationAction::Update, json!({}))
                    .with_priority(priority),
                format!("op-{}", i),
                i as u64,
                0,
            ));
        }
        ops[0].status = OperationStatus::Failed;
        ops[0].permanent_failure = true;

        let metrics = SyncMetrics::compute(&ops, &OutcomeWindow::new(10));
        assert_eq!(metrics.pending_count, 2);
        assert_eq!(metrics.failed_count, 1);
        assert_eq!(metrics.permanent_failure_count, 1);
        assert_eq!(metrics.pending_by_priority.get("low"), Some(&2));
        assert_eq!(metrics.unsynced_count(), 3);
    }
}
