//! 网络状态监控
//!
//! 平台层（Android/iOS/Web）通过 `NetworkStatusListener` 上报连通性和带宽/RTT；
//! 平台 API 不可用时默认在线，并根据请求层的成功/失败来推断真实状态。
//! 同步引擎只在 `sync_gate` 放行时才开始排空队列。

mod quality;

pub use quality::{NetworkQuality, RequestSampler};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventKind, EventManager, SDKEvent, Subscription};
use crate::utils::Clock;

/// 当前网络状态（瞬时值，不落盘）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    pub is_online: bool,
    pub quality: NetworkQuality,
    pub last_change_at: i64,
}

/// 状态迁移事件，`seq` 单调递增；快速抖动时不做去重
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTransition {
    pub seq: u64,
    pub previous: NetworkState,
    pub current: NetworkState,
}

impl NetworkTransition {
    pub fn online_changed(&self) -> bool {
        self.previous.is_online != self.current.is_online
    }
}

/// 平台上报的连通性信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformSignal {
    pub is_online: bool,
    /// 有效带宽（kbps）
    pub effective_bandwidth_kbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

impl PlatformSignal {
    pub fn online() -> Self {
        Self {
            is_online: true,
            effective_bandwidth_kbps: None,
            rtt_ms: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            is_online: false,
            effective_bandwidth_kbps: None,
            rtt_ms: None,
        }
    }

    pub fn with_metrics(mut self, bandwidth_kbps: Option<f64>, rtt_ms: Option<u64>) -> Self {
        self.effective_bandwidth_kbps = bandwidth_kbps;
        self.rtt_ms = rtt_ms;
        self
    }
}

/// 网络状态监听器（由平台层实现）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + std::fmt::Debug {
    /// 当前信号；平台无法给出时返回 None
    async fn current_signal(&self) -> Option<PlatformSignal>;

    /// 开始监听网络变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<PlatformSignal>>;

    async fn stop_monitoring(&self);
}

/// 网络监控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 在线状态翻转后的稳定窗口（毫秒），窗口内不恢复同步
    pub stabilization_window_ms: u64,
    /// 推断离线时的探测间隔（毫秒）
    pub probe_interval_ms: u64,
    /// 请求样本滑动窗口大小
    pub request_window: usize,
    /// 平台 API 不可用时，连续传输失败多少次判定为离线
    pub offline_after_failures: u32,
    pub channel_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            stabilization_window_ms: 30_000,
            probe_interval_ms: 30_000,
            request_window: 20,
            offline_after_failures: 3,
            channel_capacity: 64,
        }
    }
}

/// 同步引擎能否开始排空
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncGate {
    /// 在线且稳定
    Allowed,
    /// 推断离线，但可以发一次探测
    Probe,
    /// 刚刚翻转为在线，稳定窗口到 `until` 结束
    Unstable { until: i64 },
    Offline,
}

impl SyncGate {
    pub fn may_transmit(&self) -> bool {
        matches!(self, SyncGate::Allowed | SyncGate::Probe)
    }
}

#[derive(Debug)]
struct MonitorState {
    state: NetworkState,
    seq: u64,
    platform_available: bool,
    platform_has_metrics: bool,
    last_flip_at: Option<i64>,
    last_probe_at: Option<i64>,
    consecutive_failures: u32,
    sampler: RequestSampler,
}

/// 网络监控管理器
#[derive(Debug)]
pub struct NetworkMonitor {
    listener: Option<Arc<dyn NetworkStatusListener>>,
    config: NetworkConfig,
    clock: Arc<dyn Clock>,
    events: Arc<EventManager>,
    sender: broadcast::Sender<NetworkTransition>,
    inner: Mutex<MonitorState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkMonitor {
    pub fn new(
        listener: Option<Arc<dyn NetworkStatusListener>>,
        config: NetworkConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventManager>,
    ) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        let now = clock.now_ms();
        let inner = MonitorState {
            // 在收到任何信号之前假定在线
            state: NetworkState {
                is_online: true,
                quality: NetworkQuality::Good,
                last_change_at: now,
            },
            seq: 0,
            platform_available: listener.is_some(),
            platform_has_metrics: false,
            last_flip_at: None,
            last_probe_at: None,
            consecutive_failures: 0,
            sampler: RequestSampler::new(config.request_window),
        };

        Self {
            listener,
            config,
            clock,
            events,
            sender,
            inner: Mutex::new(inner),
            task: Mutex::new(None),
        }
    }

    /// 启动网络监控：读取初始信号并转发平台事件
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(listener) = self.listener.clone() else {
            warn!("平台网络 API 不可用，默认在线，依赖请求结果推断网络状态");
            return Ok(());
        };

        if let Some(signal) = listener.current_signal().await {
            self.apply_signal(signal);
        }

        let mut receiver = match listener.start_monitoring().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("启动平台网络监听失败，降级为默认在线: {}", e);
                self.inner.lock().platform_available = false;
                return Ok(());
            }
        };

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(signal) => monitor.apply_signal(signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("网络信号积压，跳过 {} 条", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("平台网络信号通道已关闭，降级为请求推断");
                        monitor.inner.lock().platform_available = false;
                        break;
                    }
                }
            }
        });
        if let Some(old) = self.task.lock().replace(handle) {
            old.abort();
        }

        info!("✅ 网络监控已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Some(listener) = &self.listener {
            listener.stop_monitoring().await;
        }
        info!("网络监控已停止");
    }

    pub fn get_status(&self) -> NetworkState {
        self.inner.lock().state.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().state.is_online
    }

    /// 订阅状态迁移流
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkTransition> {
        self.sender.subscribe()
    }

    /// 注册状态变化回调（在线翻转或质量档位变化时触发）
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&NetworkTransition) + Send + Sync + 'static,
    {
        self.events.add_listener(EventKind::Network, move |event| {
            if let SDKEvent::NetworkChanged { transition } = event {
                handler(transition);
            }
        })
    }

    /// 平台信号
    pub fn apply_signal(&self, signal: PlatformSignal) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.platform_available = true;
            let platform_quality =
                NetworkQuality::from_metrics(signal.effective_bandwidth_kbps, signal.rtt_ms);
            inner.platform_has_metrics = platform_quality.is_some();
            if signal.is_online {
                inner.consecutive_failures = 0;
            }
            let quality = if !signal.is_online {
                NetworkQuality::Offline
            } else {
                platform_quality
                    .or_else(|| inner.sampler.quality())
                    .unwrap_or(NetworkQuality::Good)
            };
            self.update_locked(&mut inner, signal.is_online, quality)
        };
        self.publish(transition);
    }

    /// 记录一次请求结果，用于推断质量；平台 API 不可用时还用于推断在线状态
    pub fn record_request(&self, latency_ms: u64, success: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.sampler.record(latency_ms, success);

            let mut is_online = inner.state.is_online;
            if success {
                inner.consecutive_failures = 0;
                if !inner.platform_available {
                    is_online = true;
                }
            } else {
                inner.consecutive_failures += 1;
                if !inner.platform_available
                    && inner.consecutive_failures >= self.config.offline_after_failures
                {
                    is_online = false;
                }
            }

            let quality = if !is_online {
                NetworkQuality::Offline
            } else if inner.platform_has_metrics {
                inner.state.quality
            } else {
                inner.sampler.quality().unwrap_or(NetworkQuality::Good)
            };
            self.update_locked(&mut inner, is_online, quality)
        };
        self.publish(transition);
    }

    /// 手动设置在线状态（宿主应用在连接成功/断开时调用）
    pub fn set_online(&self, is_online: bool) {
        let transition = {
            let mut inner = self.inner.lock();
            let quality = if !is_online {
                NetworkQuality::Offline
            } else if inner.state.quality == NetworkQuality::Offline {
                inner.sampler.quality().unwrap_or(NetworkQuality::Good)
            } else {
                inner.state.quality
            };
            self.update_locked(&mut inner, is_online, quality)
        };
        self.publish(transition);
    }

    /// 同步门禁：在线且过了稳定窗口才放行
    pub fn sync_gate(&self) -> SyncGate {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        if inner.state.is_online {
            if let Some(flip) = inner.last_flip_at {
                let until = flip + self.config.stabilization_window_ms as i64;
                if now < until {
                    return SyncGate::Unstable { until };
                }
            }
            return SyncGate::Allowed;
        }

        let probe_due = inner
            .last_probe_at
            .map_or(true, |at| now - at >= self.config.probe_interval_ms as i64);
        if !inner.platform_available && probe_due {
            SyncGate::Probe
        } else {
            SyncGate::Offline
        }
    }

    /// 记录一次探测，下一次探测要等 probe_interval
    pub fn mark_probe(&self) {
        let now = self.clock.now_ms();
        self.inner.lock().last_probe_at = Some(now);
    }

    pub fn platform_available(&self) -> bool {
        self.inner.lock().platform_available
    }

    fn update_locked(
        &self,
        inner: &mut MonitorState,
        is_online: bool,
        quality: NetworkQuality,
    ) -> Option<NetworkTransition> {
        let previous = inner.state.clone();
        if previous.is_online == is_online && previous.quality == quality {
            return None;
        }

        let now = self.clock.now_ms();
        if previous.is_online != is_online {
            inner.last_flip_at = Some(now);
            if is_online {
                inner.last_probe_at = None;
            }
        }
        inner.seq += 1;
        inner.state = NetworkState {
            is_online,
            quality,
            last_change_at: now,
        };
        Some(NetworkTransition {
            seq: inner.seq,
            previous,
            current: inner.state.clone(),
        })
    }

    fn publish(&self, transition: Option<NetworkTransition>) {
        let Some(transition) = transition else {
            return;
        };
        info!(
            "网络状态变化 #{}: online {} -> {}, quality {} -> {}",
            transition.seq,
            transition.previous.is_online,
            transition.current.is_online,
            transition.previous.quality,
            transition.current.quality
        );
        let _ = self.sender.send(transition.clone());
        self.events.emit(SDKEvent::NetworkChanged { transition });
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// 测试用的平台监听器：通过 `push` 模拟平台上报
    #[derive(Debug)]
    pub struct DummyNetworkStatusListener {
        signal: Mutex<PlatformSignal>,
        sender: Mutex<Option<broadcast::Sender<PlatformSignal>>>,
    }

    impl Default for DummyNetworkStatusListener {
        fn default() -> Self {
            Self {
                signal: Mutex::new(PlatformSignal::online()),
                sender: Mutex::new(None),
            }
        }
    }

    impl DummyNetworkStatusListener {
        pub fn push(&self, signal: PlatformSignal) {
            *self.signal.lock() = signal.clone();
            if let Some(tx) = self.sender.lock().as_ref() {
                let _ = tx.send(signal);
            }
        }
    }

    #[async_trait]
    impl NetworkStatusListener for DummyNetworkStatusListener {
        async fn current_signal(&self) -> Option<PlatformSignal> {
            Some(self.signal.lock().clone())
        }

        async fn start_monitoring(&self) -> Result<broadcast::Receiver<PlatformSignal>> {
            let (tx, rx) = broadcast::channel(16);
            *self.sender.lock() = Some(tx);
            Ok(rx)
        }

        async fn stop_monitoring(&self) {
            *self.sender.lock() = None;
        }
    }
}

#[cfg(test)]
pub use test_helpers::DummyNetworkStatusListener;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn monitor_without_platform(clock: Arc<ManualClock>) -> NetworkMonitor {
        NetworkMonitor::new(
            None,
            NetworkConfig::default(),
            clock,
            Arc::new(EventManager::new(16)),
        )
    }

    #[test]
    fn test_defaults_to_online_without_platform() {
        let monitor = monitor_without_platform(Arc::new(ManualClock::default()));
        assert!(monitor.is_online());
        assert_eq!(monitor.sync_gate(), SyncGate::Allowed);
        assert!(!monitor.platform_available());
    }

    #[test]
    fn test_request_failures_learn_offline_and_probe() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_without_platform(clock.clone());

        monitor.record_request(100, false);
        monitor.record_request(100, false);
        assert!(monitor.is_online());
        monitor.record_request(100, false);
        assert!(!monitor.is_online());
        assert_eq!(monitor.get_status().quality, NetworkQuality::Offline);

        // 离线推断状态下允许探测，探测后要等一个间隔
        assert_eq!(monitor.sync_gate(), SyncGate::Probe);
        monitor.mark_probe();
        assert_eq!(monitor.sync_gate(), SyncGate::Offline);
        clock.advance(Duration::from_secs(30));
        assert_eq!(monitor.sync_gate(), SyncGate::Probe);

        // 探测成功后恢复在线，但要先过稳定窗口
        monitor.record_request(80, true);
        assert!(monitor.is_online());
        assert!(matches!(monitor.sync_gate(), SyncGate::Unstable { .. }));
        clock.advance(Duration::from_secs(30));
        assert_eq!(monitor.sync_gate(), SyncGate::Allowed);
    }

    #[test]
    fn test_platform_signal_never_probes() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_without_platform(clock);
        monitor.apply_signal(PlatformSignal::offline());
        assert!(monitor.platform_available());
        assert_eq!(monitor.sync_gate(), SyncGate::Offline);
    }

    #[test]
    fn test_transitions_are_ordered_and_include_quality_changes() {
        let clock = Arc::new(ManualClock::default());
        let monitor = monitor_without_platform(clock.clone());
        let last_seq = Arc::new(AtomicU64::new(0));
        let count = Arc::new(AtomicU64::new(0));

        let seq = last_seq.clone();
        let c = count.clone();
        let _sub = monitor.on_change(move |t| {
            assert!(t.seq > seq.load(Ordering::SeqCst));
            seq.store(t.seq, Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
        });

        monitor.apply_signal(PlatformSignal::online().with_metrics(Some(20_000.0), Some(40)));
        monitor.apply_signal(PlatformSignal::online().with_metrics(Some(20_000.0), Some(40)));
        monitor.apply_signal(PlatformSignal::online().with_metrics(Some(300.0), Some(900)));
        monitor.apply_signal(PlatformSignal::offline());
        monitor.apply_signal(PlatformSignal::online());

        // Good->Excellent, Excellent->Poor, 离线, 重新在线；重复信号不触发
        assert_eq!(count.load(Ordering::SeqCst), 4);
        assert_eq!(last_seq.load(Ordering::SeqCst), 4);
        assert!(matches!(monitor.sync_gate(), SyncGate::Unstable { .. }));
    }

    #[tokio::test]
    async fn test_start_forwards_platform_signals() {
        let listener = Arc::new(DummyNetworkStatusListener::default());
        let monitor = Arc::new(NetworkMonitor::new(
            Some(listener.clone()),
            NetworkConfig::default(),
            Arc::new(ManualClock::default()),
            Arc::new(EventManager::new(16)),
        ));
        monitor.start().await.unwrap();
        let mut rx = monitor.subscribe();

        listener.push(PlatformSignal::offline());
        let transition = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(transition.online_changed());
        assert!(!transition.current.is_online);
        assert!(!monitor.is_online());

        monitor.stop().await;
    }
}
