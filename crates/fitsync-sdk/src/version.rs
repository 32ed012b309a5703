//! SDK 版本与构建元信息
//!
//! - SDK 版本 → Cargo.toml
//! - 数据库 schema 版本 → migrations/ 文件名（refinery 管理）
//! - 构建信息 → build.rs 中的 vergen

/// SDK semver，与 Cargo.toml 保持一致
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit；非 git 工作目录下构建时为 "unknown"
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// 构建时间
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 当前 SDK 支持的最高数据库 migration 版本。
/// 打开数据库时若 refinery_schema_history 中的版本更高则拒绝打开，防止降级后 schema 不兼容。
pub const SDK_DB_VERSION: i64 = parse_db_version(env!("SDK_DB_VERSION"));

const fn parse_db_version(s: &str) -> i64 {
    let b = s.as_bytes();
    let mut v = 0i64;
    let mut i = 0usize;
    while i < b.len() {
        if b[i].is_ascii_digit() {
            v = v * 10 + (b[i] - b'0') as i64;
        }
        i += 1;
    }
    v
}

/// 人类可读的版本串，日志里使用
pub fn version_string() -> String {
    format!("fitsync-sdk {} ({}, built {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}
