//! KV 存储模块 - 基于 sled
//!
//! 每个账号有独立的 sled 目录，目录下按用途划分 Tree（目前是 `cache_entries`）。
//! 值统一用 bincode 编码，批量写入走 `sled::Batch` 保证原子性。

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{FitsyncSDKError, Result};

#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    db: Db,
    trees: RwLock<HashMap<String, Tree>>,
}

impl KvStore {
    /// 打开 KV 存储。切换账号时旧实例可能刚释放文件锁，所以带退避重试。
    pub async fn open(path: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| FitsyncSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(FitsyncSDKError::KvStore(format!(
                            "打开 sled 数据库失败: {}",
                            e
                        )));
                    }
                    let delay = RETRY_DELAY_MS * (1 << attempt);
                    debug!("sled 文件锁被占用，{}ms 后重试（第 {} 次）", delay, attempt);
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            db,
            trees: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tree(&self, name: &str) -> Result<KvTree> {
        if let Some(tree) = self.trees.read().get(name) {
            return Ok(KvTree { tree: tree.clone() });
        }
        let tree = self
            .db
            .open_tree(name)
            .map_err(|e| FitsyncSDKError::KvStore(format!("打开 Tree {} 失败: {}", name, e)))?;
        self.trees.write().insert(name.to_string(), tree.clone());
        Ok(KvTree { tree })
    }

    pub fn drop_tree(&self, name: &str) -> Result<bool> {
        self.trees.write().remove(name);
        self.db
            .drop_tree(name)
            .map_err(|e| FitsyncSDKError::KvStore(format!("删除 Tree {} 失败: {}", name, e)))
    }

    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| FitsyncSDKError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

/// 单个 Tree 的类型化访问
#[derive(Debug, Clone)]
pub struct KvTree {
    tree: Tree,
}

impl KvTree {
    pub fn set<V: Serialize>(&self, key: &str, value: &V) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.tree.remove(key.as_bytes())?.is_some())
    }

    /// 原子地删除一批 key
    pub fn remove_many<'a, I>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut batch = sled::Batch::default();
        for key in keys {
            batch.remove(key.as_bytes());
        }
        self.tree.apply_batch(batch)?;
        Ok(())
    }

    /// 读取全部记录；无法解码的记录会被跳过并返回其 key
    pub fn load_all<V: DeserializeOwned>(&self) -> Result<(Vec<(String, V)>, Vec<String>)> {
        let mut records = Vec::new();
        let mut corrupted = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            match bincode::deserialize::<V>(&value) {
                Ok(v) => records.push((key, v)),
                Err(e) => {
                    warn!("KV 记录解码失败，key={}: {}", key, e);
                    corrupted.push(key);
                }
            }
        }
        Ok((records, corrupted))
    }

    pub fn clear(&self) -> Result<()> {
        self.tree.clear()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        reps: u32,
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).await.unwrap();
        let tree = store.tree("samples").unwrap();

        let sample = Sample { name: "squat".into(), reps: 5 };
        tree.set("a", &sample).unwrap();
        assert_eq!(tree.get::<Sample>("a").unwrap(), Some(sample));
        assert!(tree.remove("a").unwrap());
        assert!(!tree.remove("a").unwrap());
        assert_eq!(tree.get::<Sample>("a").unwrap(), None);
    }

    #[tokio::test]
    async fn test_remove_many_and_load_all() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).await.unwrap();
        let tree = store.tree("samples").unwrap();
        for i in 0..4 {
            tree.set(&format!("k{}", i), &Sample { name: "row".into(), reps: i }).unwrap();
        }
        tree.remove_many(["k0", "k2"]).unwrap();

        let (records, corrupted) = tree.load_all::<Sample>().unwrap();
        let keys: Vec<_> = records.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k3"]);
        assert!(corrupted.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = KvStore::open(dir.path()).await.unwrap();
            store.tree("t").unwrap().set("k", &7u32).unwrap();
            store.flush().await.unwrap();
        }
        let store = KvStore::open(dir.path()).await.unwrap();
        assert_eq!(store.tree("t").unwrap().get::<u32>("k").unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_drop_tree() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::open(dir.path()).await.unwrap();
        store.tree("gone").unwrap().set("k", &1u8).unwrap();
        assert!(store.drop_tree("gone").unwrap());
        assert!(store.tree("gone").unwrap().is_empty());
    }
}
