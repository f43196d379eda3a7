use std::{path::PathBuf, time::Duration};

use crate::llm::DEFAULT_API_BASE;

const DEFAULT_DB_PATH: &str = "vocabulary-book.db";
const DEFAULT_UI_DIR: &str = "web";
const DEFAULT_LOG_DIR: &str = "logs";

/**
 * \brief 进程级配置，来自环境变量，启动后不再变化。
 * \details 用户可编辑的设置（API Key、模型）见 `settings` 模块。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /** \brief SQLite 文件路径（VOCABOOK_DB） */
    pub db_path: PathBuf,
    /** \brief Chat Completions 基地址（VOCABOOK_API_BASE） */
    pub api_base: String,
    /** \brief 建连超时（VOCABOOK_CONNECT_TIMEOUT_SECS），默认不限 */
    pub connect_timeout: Option<Duration>,
    /** \brief `serve` 提供的静态前端目录（VOCABOOK_UI_DIR） */
    pub ui_dir: PathBuf,
    /** \brief 遥测日志目录（VOCABOOK_LOG_DIR） */
    pub log_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            api_base: DEFAULT_API_BASE.to_string(),
            connect_timeout: None,
            ui_dir: PathBuf::from(DEFAULT_UI_DIR),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            db_path: get("VOCABOOK_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_base: get("VOCABOOK_API_BASE")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            connect_timeout: get("VOCABOOK_CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            ui_dir: get("VOCABOOK_UI_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.ui_dir),
            log_dir: get("VOCABOOK_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
        }
    }
}
