//! 数据库迁移与初始化 - 由 refinery 管理
//!
//! 统一入口 `init_db`：pragmas → migrate → 版本校验。
//! 新增迁移只需在 migrations/ 添加 V{n}__{name}.sql，编译期自动嵌入。

mod embedded {
    use refinery::embed_migrations;

    embed_migrations!("./migrations");
}

use rusqlite::Connection;
use tracing::debug;

use crate::error::{FitsyncSDKError, Result};
use crate::version::SDK_DB_VERSION;

const REFINERY_TABLE: &str = "refinery_schema_history";

/// 每次状态迁移是一条语句或一个小事务
const SYNC_PRAGMAS: &str = "
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;
PRAGMA foreign_keys=ON;
PRAGMA temp_store=MEMORY;
PRAGMA busy_timeout=5000;
";

pub fn enable_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(SYNC_PRAGMAS.trim())
        .map_err(|e| FitsyncSDKError::Database(format!("设置 PRAGMA 失败: {}", e)))?;
    Ok(())
}

pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let report = embedded::migrations::runner()
        .run(conn)
        .map_err(|e| FitsyncSDKError::Migration(format!("执行 migration 失败: {}", e)))?;
    for migration in report.applied_migrations() {
        debug!("已应用 migration: {}", migration);
    }
    Ok(())
}

/// 当前数据库的 migration 版本；尚未迁移时返回 None
pub fn db_migration_version(conn: &Connection) -> Result<Option<i64>> {
    let exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [REFINERY_TABLE],
            |row| row.get(0),
        )
        .map_err(|e| FitsyncSDKError::Database(format!("查询 {} 失败: {}", REFINERY_TABLE, e)))?;
    if !exists {
        return Ok(None);
    }

    let version: Option<i64> = conn
        .query_row(
            &format!("SELECT MAX(version) FROM {}", REFINERY_TABLE),
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .map_err(|e| FitsyncSDKError::Database(format!("读取 migration 版本失败: {}", e)))?;
    Ok(version.filter(|&v| v > 0))
}

/// 数据库版本高于 SDK 支持的版本时拒绝打开
fn check_db_version(conn: &Connection) -> Result<()> {
    let Some(v) = db_migration_version(conn)? else {
        return Ok(());
    };
    if v > SDK_DB_VERSION {
        return Err(FitsyncSDKError::Database(format!(
            "数据库版本 {} 高于当前 SDK 支持的最高版本 {}，请升级 SDK 后再打开",
            v, SDK_DB_VERSION
        )));
    }
    Ok(())
}

pub fn init_db(conn: &mut Connection) -> Result<()> {
    enable_pragmas(conn)?;
    check_db_version(conn)?;
    run_migrations(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_db_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();

        for table in ["operations", "sync_conflicts"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {}", table);
        }
        assert_eq!(db_migration_version(&conn).unwrap(), Some(SDK_DB_VERSION));

        // 重复初始化是幂等的
        init_db(&mut conn).unwrap();
    }

    #[test]
    fn test_rejects_newer_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        init_db(&mut conn).unwrap();
        conn.execute(
            &format!(
                "INSERT INTO {} (version, name, applied_on, checksum) VALUES (?1, 'future', '', '0')",
                REFINERY_TABLE
            ),
            [SDK_DB_VERSION + 1],
        )
        .unwrap();

        let err = init_db(&mut conn).unwrap_err();
        assert!(matches!(err, FitsyncSDKError::Database(_)));
    }
}
