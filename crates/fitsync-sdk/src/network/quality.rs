use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// 网络质量档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Offline,
}

impl NetworkQuality {
    /// 数值越大越好
    pub fn rank(&self) -> u8 {
        match self {
            NetworkQuality::Excellent => 4,
            NetworkQuality::Good => 3,
            NetworkQuality::Fair => 2,
            NetworkQuality::Poor => 1,
            NetworkQuality::Offline => 0,
        }
    }

    pub fn worse(self, other: NetworkQuality) -> NetworkQuality {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Excellent => "excellent",
            NetworkQuality::Good => "good",
            NetworkQuality::Fair => "fair",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Offline => "offline",
        }
    }

    /// 根据平台上报的带宽 / RTT 计算档位，两者都缺失时返回 None
    pub fn from_metrics(bandwidth_kbps: Option<f64>, rtt_ms: Option<u64>) -> Option<Self> {
        let by_bandwidth = bandwidth_kbps.map(|bw| {
            if bw >= 10_000.0 {
                NetworkQuality::Excellent
            } else if bw >= 2_000.0 {
                NetworkQuality::Good
            } else if bw >= 500.0 {
                NetworkQuality::Fair
            } else {
                NetworkQuality::Poor
            }
        });
        let by_rtt = rtt_ms.map(Self::from_latency);

        match (by_bandwidth, by_rtt) {
            (Some(a), Some(b)) => Some(a.worse(b)),
            (a, b) => a.or(b),
        }
    }

    fn from_latency(latency_ms: u64) -> Self {
        match latency_ms {
            0..=100 => NetworkQuality::Excellent,
            101..=300 => NetworkQuality::Good,
            301..=700 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }
}

impl fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 请求样本滑动窗口，平台无法给出带宽 / RTT 时用来推断质量
#[derive(Debug, Clone)]
pub struct RequestSampler {
    window: usize,
    samples: VecDeque<(u64, bool)>,
}

impl RequestSampler {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, latency_ms: u64, success: bool) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back((latency_ms, success));
    }

    pub fn failure_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|(_, ok)| !ok).count();
        failures as f64 / self.samples.len() as f64
    }

    /// 成功请求的平均耗时
    pub fn average_latency_ms(&self) -> Option<u64> {
        let (sum, count) = self
            .samples
            .iter()
            .filter(|(_, ok)| *ok)
            .fold((0u64, 0u64), |(s, c), (latency, _)| (s + latency, c + 1));
        (count > 0).then(|| sum / count)
    }

    pub fn quality(&self) -> Option<NetworkQuality> {
        if self.samples.is_empty() {
            return None;
        }
        let by_failures = match self.failure_ratio() {
            r if r >= 0.5 => NetworkQuality::Poor,
            r if r >= 0.2 => NetworkQuality::Fair,
            _ => NetworkQuality::Excellent,
        };
        let by_latency = self
            .average_latency_ms()
            .map(NetworkQuality::from_latency)
            .unwrap_or(NetworkQuality::Poor);
        Some(by_failures.worse(by_latency))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_from_metrics() {
        assert_eq!(
            NetworkQuality::from_metrics(Some(50_000.0), Some(20)),
            Some(NetworkQuality::Excellent)
        );
        // 取较差的一项
        assert_eq!(
            NetworkQuality::from_metrics(Some(50_000.0), Some(500)),
            Some(NetworkQuality::Fair)
        );
        assert_eq!(NetworkQuality::from_metrics(Some(100.0), None), Some(NetworkQuality::Poor));
        assert_eq!(NetworkQuality::from_metrics(None, Some(250)), Some(NetworkQuality::Good));
        assert_eq!(NetworkQuality::from_metrics(None, None), None);
    }

    #[test]
    fn test_sampler_window_and_ratio() {
        let mut sampler = RequestSampler::new(4);
        assert!(sampler.quality().is_none());

        for _ in 0..4 {
            sampler.record(50, true);
        }
        assert_eq!(sampler.quality(), Some(NetworkQuality::Excellent));

        sampler.record(50, false);
        sampler.record(50, false);
        // 窗口只保留最近 4 条：2 成功 2 失败
        assert_eq!(sampler.len(), 4);
        assert!((sampler.failure_ratio() - 0.5).abs() < f64::EPSILON);
        assert_eq!(sampler.quality(), Some(NetworkQuality::Poor));
    }

    #[test]
    fn test_sampler_latency_tiers() {
        let mut sampler = RequestSampler::new(10);
        sampler.record(600, true);
        sampler.record(400, true);
        assert_eq!(sampler.average_latency_ms(), Some(500));
        assert_eq!(sampler.quality(), Some(NetworkQuality::Fair));
    }
}
