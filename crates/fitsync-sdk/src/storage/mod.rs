//! 存储层
//!
//! 每个账号一个独立目录 `accounts/{namespace}/`：
//! - `sync.db`：SQLite，`operations` 与 `sync_conflicts` 两张表（refinery 迁移）
//! - `kv/`：sled，`cache_entries` Tree
//!
//! 目录名是账号 id 的 SHA-256 前缀，磁盘上不出现原始账号 id，不同账号的数据互不可见。

pub mod conflict_store;
pub mod kv;
pub mod migrate;
pub mod operation_store;
pub mod queue;

use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::{FitsyncSDKError, Result};

pub use conflict_store::ConflictStore;
pub use kv::{KvStore, KvTree};
pub use operation_store::OperationStore;

pub type SharedConnection = Arc<Mutex<Connection>>;

/// sled 中缓存条目所在的 Tree
pub const CACHE_TREE: &str = "cache_entries";

/// 账号命名空间：SHA-256(account_id) 的前 16 字节十六进制
pub fn account_namespace(account_id: &str) -> String {
    let digest = Sha256::digest(account_id.as_bytes());
    hex::encode(&digest[..16])
}

/// 单个账号的本地存储
#[derive(Debug)]
pub struct AccountStorage {
    account_id: String,
    namespace: String,
    root: PathBuf,
    conn: SharedConnection,
    kv: Arc<KvStore>,
}

/// 存储统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub operation_rows: usize,
    pub cache_rows: usize,
    pub kv_size_bytes: u64,
}

impl AccountStorage {
    pub async fn open(data_dir: &Path, account_id: &str) -> Result<Self> {
        if account_id.trim().is_empty() {
            return Err(FitsyncSDKError::InvalidArgument("account_id 不能为空".into()));
        }
        let namespace = account_namespace(account_id);
        let root = data_dir.join("accounts").join(&namespace);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| FitsyncSDKError::IO(format!("创建账号目录失败: {}", e)))?;

        let db_path = root.join("sync.db");
        let mut conn = Connection::open(&db_path)
            .map_err(|e| FitsyncSDKError::Database(format!("打开数据库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        let kv = KvStore::open(&root.join("kv")).await?;

        info!("✅ 账号存储已打开: namespace={}", namespace);
        Ok(Self {
            account_id: account_id.to_string(),
            namespace,
            root,
            conn: Arc::new(Mutex::new(conn)),
            kv: Arc::new(kv),
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn operations(&self) -> OperationStore {
        OperationStore::new(self.conn.clone())
    }

    pub fn conflicts(&self) -> ConflictStore {
        ConflictStore::new(self.conn.clone())
    }

    pub fn cache_tree(&self) -> Result<KvTree> {
        self.kv.tree(CACHE_TREE)
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn stats(&self) -> Result<StorageStats> {
        Ok(StorageStats {
            operation_rows: self.operations().count()?,
            cache_rows: self.cache_tree()?.len(),
            kv_size_bytes: self.kv.size_on_disk(),
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

/// 内存数据库（已迁移），测试使用
#[cfg(test)]
pub(crate) fn open_memory_connection() -> Result<SharedConnection> {
    let mut conn = Connection::open_in_memory()?;
    migrate::init_db(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_namespace_is_stable_and_opaque() {
        let a = account_namespace("user-123");
        assert_eq!(a, account_namespace("user-123"));
        assert_ne!(a, account_namespace("user-124"));
        assert_eq!(a.len(), 32);
        assert!(!a.contains("user"));
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let dir = TempDir::new().unwrap();
        let a = AccountStorage::open(dir.path(), "alice").await.unwrap();
        let b = AccountStorage::open(dir.path(), "bob").await.unwrap();
        assert_ne!(a.root(), b.root());

        a.cache_tree().unwrap().set("k", &1u32).unwrap();
        assert!(b.cache_tree().unwrap().get::<u32>("k").unwrap().is_none());
        assert_eq!(a.stats().unwrap().cache_rows, 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_account() {
        let dir = TempDir::new().unwrap();
        assert!(AccountStorage::open(dir.path(), " ").await.is_err());
    }
}
