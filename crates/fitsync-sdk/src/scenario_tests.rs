//! 端到端场景：通过 FitsyncSDK 门面驱动离线提交、恢复联网、冲突解决

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::assert_ok;

use crate::network::DummyNetworkStatusListener;
use crate::storage::queue::{OperationFilter, OperationStatus};
use crate::*;

struct World {
    _dir: TempDir,
    sdk: Arc<FitsyncSDK>,
    remote: Arc<InMemoryRemoteStore>,
    listener: Arc<DummyNetworkStatusListener>,
    clock: Arc<ManualClock>,
}

async fn offline_world(config: FitsyncConfigBuilder) -> World {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemoteStore::new());
    let listener = Arc::new(DummyNetworkStatusListener::default());
    listener.push(PlatformSignal::offline());
    let clock = Arc::new(ManualClock::default());

    let config = config.data_dir(dir.path()).auto_start(false).build().unwrap();
    let sdk = FitsyncSDK::with_clock(config, remote.clone(), Some(listener.clone()), clock.clone())
        .await
        .unwrap();
    assert_ok!(sdk.open_session("athlete-1").await);
    assert!(!sdk.network_status().is_online);

    World {
        _dir: dir,
        sdk,
        remote,
        listener,
        clock,
    }
}

impl World {
    /// 平台报告恢复联网，并等过稳定窗口
    async fn go_online(&self) {
        self.listener.push(PlatformSignal::online());
        tokio::time::timeout(Duration::from_secs(2), async {
            while !self.sdk.network_status().is_online {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            self.sdk.sync_now().await.unwrap().skipped.as_deref(),
            Some("unstable")
        );
        self.clock.advance(Duration::from_secs(31));
    }
}

#[tokio::test]
async fn test_keep_local_conflict_on_workout_42() {
    let w = offline_world(FitsyncConfig::builder()).await;
    let v1 = w.remote.put("workout", "42", json!({"name": "Arm Day"}));
    // 另一台设备在我们离线期间改了名字
    w.remote.put("workout", "42", json!({"name": "Push Day", "sets": 5}));

    let conflicts_seen = Arc::new(AtomicUsize::new(0));
    let seen = conflicts_seen.clone();
    let subscription = w.sdk.subscribe(EventKind::Conflict, move |event| {
        if matches!(event, SDKEvent::ConflictDetected { .. }) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let op_id = assert_ok!(w.sdk.submit_operation(
        "workout",
        OperationAction::Update,
        json!({"name": "Leg Day"}),
        SubmitOptions::new().entity_id("42").expected_version(v1),
    ));

    let report = assert_ok!(w.sdk.sync_now().await);
    assert_eq!(report.skipped.as_deref(), Some("offline"));
    assert_eq!(w.remote.apply_calls(), 0);

    w.go_online().await;
    let report = assert_ok!(w.sdk.sync_now().await);
    assert_eq!(report.conflicts, 1);
    assert_eq!(conflicts_seen.load(Ordering::SeqCst), 1);
    assert_eq!(
        w.sdk.operation_status(&op_id).unwrap().unwrap().status,
        OperationStatus::Processing
    );

    let conflict = w.sdk.pending_conflicts().unwrap().remove(0);
    assert_eq!(conflict.local_version, json!({"name": "Leg Day"}));
    assert_eq!(conflict.remote_version["name"], json!("Push Day"));

    let first = assert_ok!(
        w.sdk
            .resolve_conflict(&conflict.id, ConflictStrategy::KeepLocal, None)
            .await
    );
    assert_eq!(first.resolution, ConflictResolution::Local);
    assert_eq!(first.operation_status, Some(OperationStatus::Done));
    assert_eq!(w.remote.record("workout", "42").unwrap().data["name"], json!("Leg Day"));
    let applies = w.remote.apply_calls();

    // 再次解决同一个冲突不会再访问远端
    let second = assert_ok!(
        w.sdk
            .resolve_conflict(&conflict.id, ConflictStrategy::KeepLocal, None)
            .await
    );
    assert!(second.already_resolved);
    assert_eq!(second.record, first.record);
    assert_eq!(w.remote.apply_calls(), applies);
    assert!(w.sdk.pending_conflicts().unwrap().is_empty());

    assert!(subscription.unsubscribe());
}

#[tokio::test]
async fn test_update_then_delete_never_resurrects() {
    let w = offline_world(FitsyncConfig::builder()).await;
    w.remote.put("workout", "42", json!({"name": "Old"}));

    let options = SubmitOptions::new().entity_id("42").batchable(true);
    w.sdk
        .submit_operation("workout", OperationAction::Update, json!({"name": "A"}), options.clone())
        .unwrap();
    w.sdk
        .submit_operation("workout", OperationAction::Delete, json!({}), options)
        .unwrap();

    let queued = w
        .sdk
        .list_operations(&OperationFilter::new().entity("workout", "42"))
        .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].action, OperationAction::Delete);

    w.go_online().await;
    let report = w.sdk.sync_now().await.unwrap();
    assert_eq!(report.transmitted, 1);
    assert_eq!(w.remote.apply_calls(), 1);
    assert!(w.remote.record("workout", "42").is_none());
}

#[tokio::test]
async fn test_offline_submissions_drain_in_priority_then_submission_order() {
    let w = offline_world(FitsyncConfig::builder()).await;
    let plan = [
        ("meal", OperationPriority::Low),
        ("workout", OperationPriority::High),
        ("meal", OperationPriority::Medium),
        ("challenge", OperationPriority::High),
        ("meal", OperationPriority::Low),
        ("workout", OperationPriority::Medium),
    ];
    let mut ids = Vec::new();
    for (i, (entity_type, priority)) in plan.iter().enumerate() {
        ids.push(
            w.sdk
                .submit_operation(
                    entity_type,
                    OperationAction::Create,
                    json!({"n": i}),
                    SubmitOptions::new().entity_id(format!("e{}", i)).priority(*priority),
                )
                .unwrap(),
        );
    }

    w.go_online().await;
    let session = w.sdk.session().unwrap();
    let batch = session.queue().dequeue_batch(10).unwrap();
    let order: Vec<&str> = batch.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(
        order,
        vec![
            ids[1].as_str(),
            ids[3].as_str(),
            ids[2].as_str(),
            ids[5].as_str(),
            ids[0].as_str(),
            ids[4].as_str(),
        ]
    );
}

#[tokio::test]
async fn test_tap_to_retry_after_permanent_failure() {
    let w = offline_world(FitsyncConfig::builder()).await;
    w.go_online().await;

    w.remote.reject_next("duration must be positive");
    let op_id = w
        .sdk
        .submit_operation(
            "workout",
            OperationAction::Create,
            json!({"duration": 0}),
            SubmitOptions::new(),
        )
        .unwrap();
    let report = w.sdk.sync_now().await.unwrap();
    assert_eq!(report.rejected, 1);

    let failed = w.sdk.failed_operations().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].permanent_failure);
    assert_eq!(w.sdk.pending_count(), 1);

    assert!(w.sdk.retry_operation(&op_id).unwrap());
    let report = w.sdk.sync_now().await.unwrap();
    assert_eq!(report.accepted, 1);
    assert!(w.sdk.failed_operations().unwrap().is_empty());

    let metrics = w.sdk.get_queue_metrics().unwrap();
    assert_eq!(metrics.pending_count, 0);
    assert_eq!(metrics.done_count, 1);
}

#[tokio::test]
async fn test_cache_lru_through_facade() {
    let w = offline_world(FitsyncConfig::builder().cache_config(CacheConfig {
        max_entries: Some(2),
        ..Default::default()
    }))
    .await;
    let cache = w.sdk.session().unwrap().cache().clone();

    cache.set_json("workout:1", &json!({"n": 1}), CacheSetOptions::new()).unwrap();
    w.clock.advance(Duration::from_millis(1));
    cache.set_json("workout:2", &json!({"n": 2}), CacheSetOptions::new()).unwrap();
    w.clock.advance(Duration::from_millis(1));
    assert_eq!(w.sdk.get_cached("workout:1"), Some(json!({"n": 1})));
    w.clock.advance(Duration::from_millis(1));
    cache.set_json("workout:3", &json!({"n": 3}), CacheSetOptions::new()).unwrap();

    assert!(w.sdk.get_cached("workout:2").is_none());
    assert!(w.sdk.get_cached("workout:1").is_some());
    assert!(w.sdk.get_cached("workout:3").is_some());

    let stats = w.sdk.get_cache_stats().unwrap();
    assert_eq!(stats.entry_count, 2);
    assert_eq!(stats.evictions, 1);
}

#[tokio::test]
async fn test_refresh_then_ttl_expiry() {
    let w = offline_world(FitsyncConfig::builder().cache_config(CacheConfig {
        default_ttl_ms: 60_000,
        ..Default::default()
    }))
    .await;
    w.remote.put("challenge", "c1", json!({"title": "10k steps"}));

    // 离线时拉取直接失败，不访问远端
    assert!(w.sdk.refresh("challenge", &FetchFilter::all()).await.is_err());
    assert_eq!(w.remote.fetch_calls(), 0);

    w.go_online().await;
    assert_eq!(w.sdk.refresh("challenge", &FetchFilter::all()).await.unwrap(), 1);
    assert_eq!(
        w.sdk.get_cached("challenge:c1"),
        Some(json!({"title": "10k steps"}))
    );

    w.clock.advance(Duration::from_secs(61));
    assert_eq!(w.sdk.get_cached("challenge:c1"), None::<Value>);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemoteStore::new());
    let config = FitsyncConfig::builder()
        .data_dir(dir.path())
        .auto_start(false)
        .build()
        .unwrap();

    let op_id = {
        let sdk = FitsyncSDK::with_clock(config.clone(), remote.clone(), None, Arc::new(ManualClock::default()))
            .await
            .unwrap();
        sdk.open_session("athlete-1").await.unwrap();
        let id = sdk
            .submit_operation("meal", OperationAction::Create, json!({"kcal": 420}), SubmitOptions::new())
            .unwrap();
        sdk.shutdown().await.unwrap();
        id
    };

    let sdk = FitsyncSDK::with_clock(config, remote.clone(), None, Arc::new(ManualClock::default()))
        .await
        .unwrap();
    sdk.open_session("athlete-1").await.unwrap();
    assert_eq!(sdk.pending_count(), 1);
    assert_eq!(sdk.sync_now().await.unwrap().accepted, 1);
    assert_eq!(
        sdk.operation_status(&op_id).unwrap().unwrap().status,
        OperationStatus::Done
    );
    assert!(sdk.event_stats().total_events > 0);
}
