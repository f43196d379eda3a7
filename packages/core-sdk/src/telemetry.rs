use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Result;
use once_cell::sync::Lazy;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

const LOG_FILE: &str = "vocabook.log";

static TELEMETRY_ENABLED: Lazy<RwLock<bool>> = Lazy::new(|| RwLock::new(false));

static LOG_DIR: Lazy<RwLock<PathBuf>> = Lazy::new(|| RwLock::new(PathBuf::from("logs")));

/**
 * \brief 更新遥测开关状态。
 */
pub fn set_enabled(enabled: bool) {
    if let Ok(mut guard) = TELEMETRY_ENABLED.write() {
        *guard = enabled;
    }
}

/**
 * \brief 查询当前遥测开关状态。
 */
pub fn is_enabled() -> bool {
    TELEMETRY_ENABLED.read().map(|g| *g).unwrap_or(false)
}

/**
 * \brief 设置日志目录（默认 `logs`）。
 */
pub fn set_log_dir(dir: &Path) {
    if let Ok(mut guard) = LOG_DIR.write() {
        *guard = dir.to_path_buf();
    }
}

pub fn log_path() -> PathBuf {
    LOG_DIR
        .read()
        .map(|dir| dir.join(LOG_FILE))
        .unwrap_or_else(|_| PathBuf::from(LOG_FILE))
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    record(is_enabled(), &log_path(), "INFO", category, message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    record(is_enabled(), &log_path(), "ERROR", category, message);
}

fn record(enabled: bool, path: &Path, level: &str, category: &str, message: &str) {
    if !enabled {
        return;
    }
    if let Err(err) = write_line(path, level, category, message) {
        eprintln!("telemetry write failed: {}", err);
    }
}

fn write_line(path: &Path, level: &str, category: &str, message: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} [{}] {} - {}", timestamp, level, category, message)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_writes_only_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(LOG_FILE);

        record(true, &path, "INFO", "test", "hello");
        record(false, &path, "INFO", "test", "not written");
        record(true, &path, "ERROR", "test", "boom");

        let written = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] test - hello"));
        assert!(lines[1].ends_with("[ERROR] test - boom"));
        assert!(!written.contains("not written"));
    }
}
