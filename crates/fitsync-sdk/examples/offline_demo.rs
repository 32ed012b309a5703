//! 离线优先同步演示
//!
//! 离线记录训练 -> 恢复联网 -> 后台同步 -> 处理另一台设备造成的冲突

use async_trait::async_trait;
use fitsync_sdk::{
    ConflictStrategy, EventKind, FitsyncConfig, FitsyncSDK, InMemoryRemoteStore, NetworkConfig,
    NetworkStatusListener, OperationAction, OperationPriority, PlatformSignal, SDKEvent,
    SchedulerConfig, SubmitOptions,
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;

/// 演示用的平台网络监听器，手动切换在线状态
#[derive(Debug)]
struct DemoNetwork {
    online: Mutex<bool>,
    sender: broadcast::Sender<PlatformSignal>,
}

impl DemoNetwork {
    fn new(online: bool) -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            online: Mutex::new(online),
            sender,
        }
    }

    fn set_online(&self, online: bool) {
        *self.online.lock() = online;
        let signal = if online {
            PlatformSignal::online().with_metrics(Some(12_000.0), Some(40))
        } else {
            PlatformSignal::offline()
        };
        let _ = self.sender.send(signal);
    }
}

#[async_trait]
impl NetworkStatusListener for DemoNetwork {
    async fn current_signal(&self) -> Option<PlatformSignal> {
        Some(if *self.online.lock() {
            PlatformSignal::online()
        } else {
            PlatformSignal::offline()
        })
    }

    async fn start_monitoring(&self) -> fitsync_sdk::Result<broadcast::Receiver<PlatformSignal>> {
        Ok(self.sender.subscribe())
    }

    async fn stop_monitoring(&self) {}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("\n==============================================");
    println!("🏋️ Fitsync 离线优先同步演示");
    println!("==============================================\n");

    let data_dir = tempfile::tempdir()?;
    let remote = Arc::new(InMemoryRemoteStore::new());
    let network = Arc::new(DemoNetwork::new(false));

    let config = FitsyncConfig::builder()
        .data_dir(data_dir.path())
        .network_config(NetworkConfig {
            stabilization_window_ms: 500,
            ..Default::default()
        })
        .scheduler_config(SchedulerConfig {
            tick_interval_ms: 200,
            ..Default::default()
        })
        .build()?;
    let sdk = FitsyncSDK::initialize(config, remote.clone(), Some(network.clone())).await?;
    sdk.open_session("athlete-1").await?;

    let subscription = sdk.subscribe(EventKind::All, |event| match event {
        SDKEvent::MetricsChanged { metrics, .. } => {
            println!("  📊 等待同步 {} 条，成功率 {:.0}%", metrics.unsynced_count(), metrics.success_rate * 100.0)
        }
        SDKEvent::ConflictDetected { entity_type, entity_id, .. } => {
            println!("  ⚔️ 冲突: {}:{}", entity_type, entity_id)
        }
        SDKEvent::NetworkChanged { transition } => {
            println!("  📡 网络: online={}", transition.current.is_online)
        }
        _ => {}
    });

    // 场景 1: 离线记录
    println!("\n📴 场景 1: 离线记录训练");
    let v1 = remote.put("workout", "42", json!({"name": "Arm Day", "sets": 3}));
    sdk.submit_operation(
        "workout",
        OperationAction::Create,
        json!({"name": "Morning Run", "distance_km": 5.2}),
        SubmitOptions::new().priority(OperationPriority::High),
    )?;
    sdk.submit_operation(
        "workout",
        OperationAction::Update,
        json!({"name": "Leg Day"}),
        SubmitOptions::new().entity_id("42").expected_version(v1),
    )?;
    // 另一台设备同时改了同一条训练
    remote.put("workout", "42", json!({"name": "Push Day", "sets": 5}));
    println!("  待同步: {}", sdk.pending_count());

    // 场景 2: 恢复联网
    println!("\n📶 场景 2: 恢复联网，等待后台同步");
    network.set_online(true);
    for _ in 0..50 {
        if !sdk.pending_conflicts()?.is_empty() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    // 场景 3: 保留本地版本
    println!("\n🛠️ 场景 3: 解决冲突（保留本地）");
    for conflict in sdk.pending_conflicts()? {
        let outcome = sdk
            .resolve_conflict(&conflict.id, ConflictStrategy::KeepLocal, None)
            .await?;
        println!("  ✅ {} -> {:?}", conflict.id, outcome.resolution);
    }
    if let Some(record) = remote.record("workout", "42") {
        println!("  远端记录: {} ({})", record.data, record.version);
    }

    println!("\n📈 队列指标: {:?}", sdk.get_queue_metrics()?);
    println!("📈 事件统计: {} 条", sdk.event_stats().total_events);

    subscription.unsubscribe();
    sdk.shutdown().await?;

    println!("\n==============================================");
    println!("✅ 演示完成");
    println!("==============================================\n");
    Ok(())
}
