//! 远端存储协作方
//!
//! 后端 API 由宿主应用实现 `RemoteStore`；传输层错误通过 `Err` 返回，
//! 业务结果（接受 / 校验拒绝 / 版本冲突）通过 `ApplyOutcome` 返回。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::{FitsyncSDKError, Result};
use crate::storage::queue::{merge_payload, OperationAction};

/// 一次 apply 的业务结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// 远端接受，返回新版本号（删除时 record 为空）
    Accepted {
        version: String,
        record: Option<Value>,
    },
    /// 校验失败，永不自动重试
    Rejected { reason: String },
    /// 版本不匹配，附带远端当前版本
    Conflict {
        current_version: String,
        remote_record: Value,
    },
}

/// 拉取条件
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchFilter {
    pub ids: Vec<String>,
    pub updated_since: Option<i64>,
    pub limit: Option<usize>,
}

impl FetchFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn updated_since(mut self, timestamp: i64) -> Self {
        self.updated_since = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 远端记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub entity_id: String,
    pub version: String,
    pub data: Value,
}

#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    async fn apply(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: OperationAction,
        payload: &Value,
        expected_version: Option<&str>,
    ) -> Result<ApplyOutcome>;

    async fn fetch(&self, entity_type: &str, filter: &FetchFilter) -> Result<Vec<RemoteRecord>>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    version: String,
    data: Value,
    updated_at: i64,
}

/// 内存中的远端存储：单一权威副本 + 版本号校验。
/// 用于离线演示和集成测试，可以注入传输失败与校验拒绝。
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    records: Mutex<BTreeMap<(String, String), StoredRecord>>,
    version_counter: AtomicU64,
    apply_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    unreachable: AtomicBool,
    scripted_failures: Mutex<VecDeque<FitsyncSDKError>>,
    scripted_rejections: Mutex<VecDeque<String>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> (String, i64) {
        let n = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        (format!("v{}", n), n as i64)
    }

    /// 直接写入远端（模拟其他设备的修改），返回新版本号
    pub fn put(&self, entity_type: &str, entity_id: &str, data: Value) -> String {
        let (version, updated_at) = self.next_version();
        self.records.lock().insert(
            (entity_type.to_string(), entity_id.to_string()),
            StoredRecord {
                version: version.clone(),
                data,
                updated_at,
            },
        );
        version
    }

    pub fn record(&self, entity_type: &str, entity_id: &str) -> Option<RemoteRecord> {
        self.records
            .lock()
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map(|r| RemoteRecord {
                entity_id: entity_id.to_string(),
                version: r.version.clone(),
                data: r.data.clone(),
            })
    }

    /// 模拟网络断开：所有请求返回传输错误
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// 下一次 apply 返回该传输错误
    pub fn fail_next(&self, error: FitsyncSDKError) {
        self.scripted_failures.lock().push_back(error);
    }

    /// 下一次 apply 被校验拒绝
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.scripted_rejections.lock().push_back(reason.into());
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FitsyncSDKError::TransientNetwork(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn apply(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: OperationAction,
        payload: &Value,
        expected_version: Option<&str>,
    ) -> Result<ApplyOutcome> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if let Some(error) = self.scripted_failures.lock().pop_front() {
            return Err(error);
        }
        if let Some(reason) = self.scripted_rejections.lock().pop_front() {
            return Ok(ApplyOutcome::Rejected { reason });
        }

        let key = (entity_type.to_string(), entity_id.to_string());
        let mut records = self.records.lock();
        if let Some(current) = records.get(&key) {
            let stale = match expected_version {
                Some(expected) => expected != current.version,
                // 没带版本号的 create 撞上已有记录
                None => action == OperationAction::Create,
            };
            if stale {
                return Ok(ApplyOutcome::Conflict {
                    current_version: current.version.clone(),
                    remote_record: current.data.clone(),
                });
            }
        }

        let (version, updated_at) = self.next_version();
        match action {
            OperationAction::Delete => {
                records.remove(&key);
                Ok(ApplyOutcome::Accepted {
                    version,
                    record: None,
                })
            }
            OperationAction::Create | OperationAction::Update => {
                let data = match (action, records.get(&key)) {
                    (OperationAction::Update, Some(current)) => merge_payload(&current.data, payload),
                    _ => payload.clone(),
                };
                records.insert(
                    key,
                    StoredRecord {
                        version: version.clone(),
                        data: data.clone(),
                        updated_at,
                    },
                );
                Ok(ApplyOutcome::Accepted {
                    version,
                    record: Some(data),
                })
            }
        }
    }

    async fn fetch(&self, entity_type: &str, filter: &FetchFilter) -> Result<Vec<RemoteRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let records = self.records.lock();
        let mut result: Vec<RemoteRecord> = records
            .iter()
            .filter(|((t, id), r)| {
                t == entity_type
                    && (filter.ids.is_empty() || filter.ids.contains(id))
                    && filter.updated_since.map_or(true, |since| r.updated_at > since)
            })
            .map(|((_, id), r)| RemoteRecord {
                entity_id: id.clone(),
                version: r.version.clone(),
                data: r.data.clone(),
            })
            .collect();
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_version_check() {
        let remote = InMemoryRemoteStore::new();
        let v1 = remote.put("workout", "42", json!({"name": "Leg Day", "sets": 3}));

        let outcome = remote
            .apply("workout", "42", OperationAction::Update, &json!({"sets": 4}), Some(&v1))
            .await
            .unwrap();
        let ApplyOutcome::Accepted { version, record } = outcome else {
            panic!("expected accepted, got {:?}", outcome);
        };
        assert_eq!(record, Some(json!({"name": "Leg Day", "sets": 4})));

        // 过期版本号
        let outcome = remote
            .apply("workout", "42", OperationAction::Update, &json!({"sets": 5}), Some(&v1))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Conflict {
                current_version: version,
                remote_record: json!({"name": "Leg Day", "sets": 4}),
            }
        );
        assert_eq!(remote.apply_calls(), 2);
    }

    #[tokio::test]
    async fn test_scripted_failures_and_fetch() {
        let remote = InMemoryRemoteStore::new();
        remote.fail_next(FitsyncSDKError::Timeout("apply".into()));
        remote.reject_next("name too long");

        let err = remote
            .apply("workout", "1", OperationAction::Create, &json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            remote.apply("workout", "1", OperationAction::Create, &json!({}), None).await.unwrap(),
            ApplyOutcome::Rejected { .. }
        ));

        remote.put("workout", "1", json!({"n": 1}));
        remote.put("workout", "2", json!({"n": 2}));
        remote.put("league", "9", json!({}));
        let all = remote.fetch("workout", &FetchFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);
        let one = remote.fetch("workout", &FetchFilter::ids(["2"])).await.unwrap();
        assert_eq!(one[0].data, json!({"n": 2}));

        remote.set_unreachable(true);
        assert!(remote.fetch("workout", &FetchFilter::all()).await.is_err());
    }
}
