//! `operations` 表的读写
//!
//! 每次状态迁移都是一条语句或一个事务，崩溃后不会留下半条记录。

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::SharedConnection;
use crate::error::{FitsyncSDKError, Result};
use crate::storage::queue::{OperationPriority, QueuedOperation, SyncFailureReason};

const COLUMNS: &str = "id, seq, entity_type, entity_id, action, payload, priority, status, attempts, \
    last_error, failure_reason, batchable, expected_version, next_attempt_at, permanent_failure, \
    created_at, updated_at, processing_started_at, completed_at";

#[derive(Debug, Clone)]
pub struct OperationStore {
    conn: SharedConnection,
}

impl OperationStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// 插入或整行覆盖
    pub fn upsert(&self, op: &QueuedOperation) -> Result<()> {
        let conn = self.conn.lock();
        write_operation(&conn, op)
    }

    /// 在一个事务中写入多条记录
    pub fn upsert_many(&self, ops: &[QueuedOperation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| FitsyncSDKError::Database(format!("开启事务失败: {}", e)))?;
        for op in ops {
            write_operation(&tx, op)?;
        }
        tx.commit()
            .map_err(|e| FitsyncSDKError::Database(format!("提交事务失败: {}", e)))?;
        Ok(())
    }

    /// 删除一批记录并（可选）写入一条新记录，合并入队时使用
    pub fn replace(&self, removed_ids: &[String], inserted: Option<&QueuedOperation>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| FitsyncSDKError::Database(format!("开启事务失败: {}", e)))?;
        for id in removed_ids {
            tx.execute("DELETE FROM operations WHERE id = ?1", params![id])
                .map_err(|e| FitsyncSDKError::Database(format!("删除操作失败: {}", e)))?;
        }
        if let Some(op) = inserted {
            write_operation(&tx, op)?;
        }
        tx.commit()
            .map_err(|e| FitsyncSDKError::Database(format!("提交事务失败: {}", e)))?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute("DELETE FROM operations WHERE id = ?1", params![id])
            .map_err(|e| FitsyncSDKError::Database(format!("删除操作失败: {}", e)))?;
        Ok(n > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedOperation>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM operations WHERE id = ?1", COLUMNS),
            params![id],
            read_operation,
        )
        .optional()
        .map_err(|e| FitsyncSDKError::Database(format!("查询操作失败: {}", e)))
    }

    /// 按提交顺序读取全部记录
    pub fn load_all(&self) -> Result<Vec<QueuedOperation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM operations ORDER BY seq ASC", COLUMNS))
            .map_err(|e| FitsyncSDKError::Database(format!("准备查询失败: {}", e)))?;
        let rows = stmt
            .query_map([], read_operation)
            .map_err(|e| FitsyncSDKError::Database(format!("读取操作队列失败: {}", e)))?;
        let mut ops = Vec::new();
        for row in rows {
            ops.push(row.map_err(|e| FitsyncSDKError::Database(format!("解析操作失败: {}", e)))?);
        }
        Ok(ops)
    }

    /// 清理 `before` 之前完成的操作
    pub fn prune_done(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM operations WHERE status = 'done' AND completed_at < ?1",
            params![before],
        )
        .map_err(|e| FitsyncSDKError::Database(format!("清理已完成操作失败: {}", e)))
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))
            .map_err(|e| FitsyncSDKError::Database(format!("统计操作失败: {}", e)))?;
        Ok(n as usize)
    }

    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM operations", [])
            .map_err(|e| FitsyncSDKError::Database(format!("清空操作队列失败: {}", e)))?;
        Ok(())
    }
}

fn write_operation(conn: &Connection, op: &QueuedOperation) -> Result<()> {
    let payload = serde_json::to_string(&op.payload)?;
    let failure_reason = op
        .last_failure_reason
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO operations ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            COLUMNS
        ),
        params![
            op.id,
            op.seq as i64,
            op.entity_type,
            op.entity_id,
            op.action.as_str(),
            payload,
            op.priority.value() as i64,
            op.status.as_str(),
            op.attempts as i64,
            op.last_error,
            failure_reason,
            op.batchable,
            op.expected_version,
            op.next_attempt_at,
            op.permanent_failure,
            op.created_at,
            op.updated_at,
            op.processing_started_at,
            op.completed_at,
        ],
    )
    .map_err(|e| FitsyncSDKError::Database(format!("写入操作 {} 失败: {}", op.id, e)))?;
    Ok(())
}

fn conversion_error(idx: usize, err: FitsyncSDKError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn read_operation(row: &Row<'_>) -> rusqlite::Result<QueuedOperation> {
    let action: String = row.get(4)?;
    let payload: String = row.get(5)?;
    let priority: i64 = row.get(6)?;
    let status: String = row.get(7)?;
    let failure_reason: Option<String> = row.get(10)?;

    let last_failure_reason = failure_reason
        .map(|s| serde_json::from_str::<SyncFailureReason>(&s))
        .transpose()
        .map_err(|e| conversion_error(10, e.into()))?;

    Ok(QueuedOperation {
        id: row.get(0)?,
        seq: row.get::<_, i64>(1)? as u64,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        action: action.parse().map_err(|e| conversion_error(4, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(5, e.into()))?,
        priority: OperationPriority::from_value(priority as u8).ok_or_else(|| {
            conversion_error(6, FitsyncSDKError::InvalidArgument(format!("优先级 {}", priority)))
        })?,
        status: status.parse().map_err(|e| conversion_error(7, e))?,
        attempts: row.get::<_, i64>(8)? as u32,
        last_error: row.get(9)?,
        last_failure_reason,
        batchable: row.get(11)?,
        expected_version: row.get(12)?,
        next_attempt_at: row.get(13)?,
        permanent_failure: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        processing_started_at: row.get(17)?,
        completed_at: row.get(18)?,
    })
}
