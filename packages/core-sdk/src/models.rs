use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/**
 * \brief 消息角色，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 生词本条目。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VocabularyItem {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 归一化（小写、去空白）后的单词，作为自然键 */
    pub word: String,
    /** \brief 创建或最近一次录入的时间 */
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /** \brief 归档标记（核心逻辑不使用） */
    pub archived: bool,
    /** \brief 缓存的模型讲解 */
    pub detail: Option<String>,
    /** \brief 被纳入复习练习的次数 */
    pub review_count: u32,
}

/**
 * \brief 生词条目的部分更新，`None` 字段保持原值。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VocabularyUpdate {
    pub timestamp: Option<OffsetDateTime>,
    pub archived: Option<bool>,
    pub detail: Option<String>,
    pub review_count: Option<u32>,
}

/**
 * \brief 已生成的复习练习。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub id: i64,
    /** \brief 练习全文（含答案段） */
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /** \brief 本次练习引用的生词 ID */
    pub vocabulary_ids: Vec<i64>,
}

/**
 * \brief 当前 UTC 时间，截断到毫秒以与存储精度一致。
 */
pub fn timestamp_now() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - time::Duration::nanoseconds(i64::from(now.nanosecond() % 1_000_000))
}
