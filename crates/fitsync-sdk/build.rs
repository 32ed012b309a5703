//! 编译期元信息：vergen 生成 BUILD_TIMESTAMP / GIT_SHA，
//! 另外扫描 migrations/ 下的 V{version}__*.sql 得到 SDK_DB_VERSION。

use std::env;
use std::fs;
use std::path::Path;
use vergen::EmitBuilder;

fn main() {
    // 非 git 目录下 vergen 会输出占位值，version.rs 再做兜底
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit();

    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".to_string());
    let max_version = max_migration_version(&Path::new(&manifest_dir).join("migrations"));

    println!("cargo:rustc-env=SDK_DB_VERSION={}", max_version);
    println!("cargo:rerun-if-changed=migrations/");
}

/// refinery 文件名格式: V{version}__{name}.sql
fn max_migration_version(dir: &Path) -> i64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let rest = name.strip_prefix('V')?.strip_suffix(".sql")?;
            rest.split("__").next()?.parse::<i64>().ok()
        })
        .max()
        .unwrap_or(0)
}
