//! `sync_conflicts` 表：待解决的冲突跨重启保留，已解决的冲突在保留期后清理

use rusqlite::{params, OptionalExtension, Row};

use super::SharedConnection;
use crate::error::{FitsyncSDKError, Result};
use crate::sync::conflict::{ConflictResolution, SyncConflict};

const COLUMNS: &str = "id, operation_id, entity_type, entity_id, local_version, remote_version, \
    remote_version_token, detected_at, resolution, resolved_record, resolved_at";

#[derive(Debug, Clone)]
pub struct ConflictStore {
    conn: SharedConnection,
}

impl ConflictStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    pub fn upsert(&self, conflict: &SyncConflict) -> Result<()> {
        let local = serde_json::to_string(&conflict.local_version)?;
        let remote = serde_json::to_string(&conflict.remote_version)?;
        let resolved = conflict
            .resolved_record
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let resolution = match conflict.resolution {
            ConflictResolution::Pending => None,
            other => Some(other.as_str()),
        };

        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO sync_conflicts ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                COLUMNS
            ),
            params![
                conflict.id,
                conflict.operation_id,
                conflict.entity_type,
                conflict.entity_id,
                local,
                remote,
                conflict.remote_version_token,
                conflict.detected_at,
                resolution,
                resolved,
                conflict.resolved_at,
            ],
        )
        .map_err(|e| FitsyncSDKError::Database(format!("写入冲突 {} 失败: {}", conflict.id, e)))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<SyncConflict>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM sync_conflicts WHERE id = ?1", COLUMNS),
            params![id],
            read_conflict,
        )
        .optional()
        .map_err(|e| FitsyncSDKError::Database(format!("查询冲突失败: {}", e)))
    }

    /// 所有尚未解决的冲突，按检测时间排序
    pub fn list_pending(&self) -> Result<Vec<SyncConflict>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM sync_conflicts WHERE resolution IS NULL ORDER BY detected_at ASC",
                COLUMNS
            ))
            .map_err(|e| FitsyncSDKError::Database(format!("准备查询失败: {}", e)))?;
        let rows = stmt
            .query_map([], read_conflict)
            .map_err(|e| FitsyncSDKError::Database(format!("读取冲突失败: {}", e)))?;
        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(row.map_err(|e| FitsyncSDKError::Database(format!("解析冲突失败: {}", e)))?);
        }
        Ok(conflicts)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM sync_conflicts WHERE id = ?1", params![id])
            .map_err(|e| FitsyncSDKError::Database(format!("删除冲突失败: {}", e)))?;
        Ok(n > 0)
    }

    /// 清理 `before` 之前解决的冲突
    pub fn prune_resolved(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM sync_conflicts WHERE resolution IS NOT NULL AND resolved_at < ?1",
            params![before],
        )
        .map_err(|e| FitsyncSDKError::Database(format!("清理已解决冲突失败: {}", e)))
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_conflicts", [])
            .map_err(|e| FitsyncSDKError::Database(format!("清空冲突表失败: {}", e)))?;
        Ok(())
    }
}

fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn read_conflict(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    let resolution: Option<String> = row.get(8)?;
    let resolution = match resolution {
        None => ConflictResolution::Pending,
        Some(s) => s.parse().map_err(|e: FitsyncSDKError| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?,
    };
    let resolved_record = match row.get::<_, Option<String>>(9)? {
        Some(_) => Some(json_column(row, 9)?),
        None => None,
    };

    Ok(SyncConflict {
        id: row.get(0)?,
        operation_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        local_version: json_column(row, 4)?,
        remote_version: json_column(row, 5)?,
        remote_version_token: row.get(6)?,
        detected_at: row.get(7)?,
        resolution,
        resolved_record,
        resolved_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_connection;
    use serde_json::json;

    fn conflict(id: &str, detected_at: i64) -> SyncConflict {
        SyncConflict {
            id: id.to_string(),
            operation_id: format!("op-{}", id),
            entity_type: "workout".into(),
            entity_id: "42".into(),
            local_version: json!({"name": "Leg Day"}),
            remote_version: json!({"name": "Arm Day"}),
            remote_version_token: "v7".into(),
            detected_at,
            resolution: ConflictResolution::Pending,
            resolved_record: None,
            resolved_at: None,
        }
    }

    #[test]
    fn test_pending_and_resolved() {
        let store = ConflictStore::new(open_memory_connection().unwrap());
        store.upsert(&conflict("b", 20)).unwrap();
        store.upsert(&conflict("a", 10)).unwrap();

        let pending = store.list_pending().unwrap();
        assert_eq!(pending.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(pending[0], conflict("a", 10));

        let mut resolved = conflict("a", 10);
        resolved.resolution = ConflictResolution::Local;
        resolved.resolved_record = Some(json!({"name": "Leg Day"}));
        resolved.resolved_at = Some(50);
        store.upsert(&resolved).unwrap();

        assert_eq!(store.list_pending().unwrap().len(), 1);
        assert_eq!(store.get("a").unwrap(), Some(resolved));

        assert_eq!(store.prune_resolved(40).unwrap(), 0);
        assert_eq!(store.prune_resolved(60).unwrap(), 1);
        assert!(store.get("a").unwrap().is_none());
    }
}
