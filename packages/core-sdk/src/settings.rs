use anyhow::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::{db, llm};

/**
 * \brief 可由用户修改的设置项。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    OpenaiApiKey,
    OpenaiModel,
}

impl SettingKey {
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::OpenaiApiKey => "openai_api_key",
            SettingKey::OpenaiModel => "openai_model",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "openai_api_key" => Some(SettingKey::OpenaiApiKey),
            "openai_model" => Some(SettingKey::OpenaiModel),
            _ => None,
        }
    }
}

/**
 * \brief 设置快照。修改设置得到新快照，旧快照保持不变。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub openai_api_key: String,
    pub openai_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_model: llm::DEFAULT_MODEL.to_string(),
        }
    }
}

impl Settings {
    /**
     * \brief 从 credentials 表加载；未知的设置名忽略。
     */
    pub fn load(conn: &Connection) -> Result<Self> {
        let settings = db::list_credentials(conn)?
            .into_iter()
            .filter_map(|(name, value)| SettingKey::parse(&name).map(|key| (key, value)))
            .fold(Self::default(), |settings, (key, value)| {
                settings.with_setting(key, &value)
            });
        Ok(settings)
    }

    pub fn with_setting(&self, key: SettingKey, value: &str) -> Self {
        let mut next = self.clone();
        match key {
            SettingKey::OpenaiApiKey => next.openai_api_key = value.trim().to_string(),
            SettingKey::OpenaiModel => next.openai_model = value.trim().to_string(),
        }
        next
    }

    pub fn has_api_key(&self) -> bool {
        !self.openai_api_key.trim().is_empty()
    }

    /**
     * \brief 实际使用的模型：不在允许列表中时为默认模型。
     */
    pub fn model(&self) -> &'static str {
        llm::resolve_model(&self.openai_model)
    }

    /**
     * \brief 用于展示的脱敏 Key。
     */
    pub fn masked_api_key(&self) -> String {
        let key = self.openai_api_key.trim();
        let chars: Vec<char> = key.chars().collect();
        if chars.is_empty() {
            String::new()
        } else if chars.len() <= 8 {
            "*".repeat(chars.len())
        } else {
            let head: String = chars[..3].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}...{}", head, tail)
        }
    }
}

/**
 * \brief 持久化一个设置项并返回新的快照。
 */
pub fn store_setting(
    conn: &Connection,
    current: &Settings,
    key: SettingKey,
    value: &str,
) -> Result<Settings> {
    let next = current.with_setting(key, value);
    let stored = match key {
        SettingKey::OpenaiApiKey => &next.openai_api_key,
        SettingKey::OpenaiModel => &next.openai_model,
    };
    db::upsert_credential(conn, key.as_str(), stored)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::mem_conn;

    #[test]
    fn test_defaults_without_stored_values() {
        let conn = mem_conn();
        let settings = Settings::load(&conn).expect("load");
        assert_eq!(settings, Settings::default());
        assert!(!settings.has_api_key());
        assert_eq!(settings.model(), llm::DEFAULT_MODEL);
    }

    #[test]
    fn test_store_returns_new_snapshot_and_persists() {
        let conn = mem_conn();
        let original = Settings::load(&conn).expect("load");
        let updated =
            store_setting(&conn, &original, SettingKey::OpenaiApiKey, " sk-abcdef123456 ")
                .expect("store key");
        let updated =
            store_setting(&conn, &updated, SettingKey::OpenaiModel, "gpt-4o").expect("store model");

        assert_eq!(original, Settings::default());
        assert_eq!(updated.openai_api_key, "sk-abcdef123456");
        assert_eq!(updated.model(), "gpt-4o");
        assert_eq!(Settings::load(&conn).expect("reload"), updated);
    }

    #[test]
    fn test_unknown_model_resolves_to_default() {
        let settings = Settings::default().with_setting(SettingKey::OpenaiModel, "davinci");
        assert_eq!(settings.openai_model, "davinci");
        assert_eq!(settings.model(), llm::DEFAULT_MODEL);
    }

    #[test]
    fn test_unknown_credential_rows_are_ignored() {
        let conn = mem_conn();
        db::upsert_credential(&conn, "legacy_theme", "dark").expect("insert");
        assert_eq!(Settings::load(&conn).expect("load"), Settings::default());
    }

    #[test]
    fn test_masked_api_key() {
        let s = Settings::default();
        assert_eq!(s.masked_api_key(), "");
        let s = s.with_setting(SettingKey::OpenaiApiKey, "short");
        assert_eq!(s.masked_api_key(), "*****");
        let s = s.with_setting(SettingKey::OpenaiApiKey, "sk-abcdef123456");
        assert_eq!(s.masked_api_key(), "sk-...3456");
    }
}
