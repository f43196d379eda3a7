pub mod config;
pub mod db;
pub mod detail;
pub mod llm;
pub mod models;
pub mod review;
pub mod server;
pub mod settings;
pub mod sse;
pub mod telemetry;
pub mod vocabulary;

#[cfg(test)]
pub(crate) mod testing;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::db;
    pub use crate::detail;
    pub use crate::llm::{self, ChatClient, ChatError};
    pub use crate::models;
    pub use crate::review;
    pub use crate::server;
    pub use crate::settings::{SettingKey, Settings};
    pub use crate::telemetry;
    pub use crate::vocabulary::VocabularyBook;
}
