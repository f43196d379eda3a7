use anyhow::{anyhow, bail, Result};
use rusqlite::Connection;
use time::OffsetDateTime;

use crate::{
    db,
    models::{timestamp_now, VocabularyItem, VocabularyUpdate},
    telemetry,
};

/**
 * \brief 归一化用户输入的单词：去首尾空白并转小写，空输入返回 None。
 */
pub fn normalize_word(input: &str) -> Option<String> {
    let word = input.trim().to_lowercase();
    if word.is_empty() {
        None
    } else {
        Some(word)
    }
}

/**
 * \brief `add_word` 的结果。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedWord {
    pub item: VocabularyItem,
    /** \brief false 表示单词已存在，仅刷新了时间戳 */
    pub created: bool,
}

/**
 * \brief 生词本：持久化存储之上的内存镜像，每次写操作成功后同步。
 */
pub struct VocabularyBook {
    conn: Connection,
    items: Vec<VocabularyItem>,
}

impl VocabularyBook {
    /**
     * \brief 从已迁移的连接加载全部生词。
     */
    pub fn load(conn: Connection) -> Result<Self> {
        let items = db::list_vocabulary(&conn)?;
        Ok(Self { conn, items })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn items(&self) -> &[VocabularyItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /**
     * \brief 按时间戳倒序（最近录入在前）。
     */
    pub fn sorted_by_recent(&self) -> Vec<&VocabularyItem> {
        let mut sorted: Vec<&VocabularyItem> = self.items.iter().collect();
        sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        sorted
    }

    pub fn get(&self, id: i64) -> Option<&VocabularyItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /**
     * \brief 忽略大小写查找单词。
     */
    pub fn find_word(&self, word: &str) -> Option<&VocabularyItem> {
        let word = normalize_word(word)?;
        self.items.iter().find(|item| item.word == word)
    }

    /**
     * \brief 录入单词；已存在时只刷新时间戳，不产生重复记录。
     */
    pub fn add_word(&mut self, input: &str) -> Result<AddedWord> {
        let word = normalize_word(input).ok_or_else(|| anyhow!("word must not be empty"))?;
        let now = timestamp_now();

        if let Some(existing) = db::find_vocabulary_by_word(&self.conn, &word)? {
            db::update_vocabulary(
                &self.conn,
                existing.id,
                &VocabularyUpdate {
                    timestamp: Some(now),
                    ..Default::default()
                },
            )?;
            let item = VocabularyItem {
                timestamp: now,
                ..existing
            };
            self.upsert_mirror(item.clone());
            telemetry::log_event(
                "vocabulary.add",
                &format!("touch id={} word={}", item.id, word),
            );
            return Ok(AddedWord {
                item,
                created: false,
            });
        }

        let id = db::insert_vocabulary(&self.conn, &word, now)?;
        let item = VocabularyItem {
            id,
            word,
            timestamp: now,
            archived: false,
            detail: None,
            review_count: 0,
        };
        self.upsert_mirror(item.clone());
        telemetry::log_event(
            "vocabulary.add",
            &format!("insert id={} word={}", id, item.word),
        );
        Ok(AddedWord {
            item,
            created: true,
        })
    }

    pub fn delete(&mut self, id: i64) -> Result<()> {
        db::delete_vocabulary(&self.conn, id)?;
        self.items.retain(|item| item.id != id);
        telemetry::log_event("vocabulary.delete", &format!("id={}", id));
        Ok(())
    }

    /**
     * \brief 缓存讲解文本。
     */
    pub fn set_detail(&mut self, id: i64, detail: &str) -> Result<()> {
        db::update_vocabulary(
            &self.conn,
            id,
            &VocabularyUpdate {
                detail: Some(detail.to_string()),
                ..Default::default()
            },
        )?;
        if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
            item.detail = Some(detail.to_string());
        }
        Ok(())
    }

    /**
     * \brief 保存复习练习并把所选生词的复习次数各加一，返回练习 id。
     * \details 存储拒绝（例如生词已被其他连接删除）时整体不生效，镜像按存储刷新。
     */
    pub fn record_review(
        &mut self,
        content: &str,
        timestamp: OffsetDateTime,
        ids: &[i64],
    ) -> Result<i64> {
        if let Some(missing) = ids.iter().find(|id| self.get(**id).is_none()) {
            bail!("vocabulary id {} not found", missing);
        }
        let review_id = match db::insert_review(&self.conn, content, timestamp, ids) {
            Ok(review_id) => review_id,
            Err(e) => {
                self.reload()?;
                return Err(e);
            }
        };
        for item in self.items.iter_mut().filter(|item| ids.contains(&item.id)) {
            item.review_count += 1;
        }
        telemetry::log_event(
            "vocabulary.review",
            &format!("review={} ids={:?}", review_id, ids),
        );
        Ok(review_id)
    }

    /**
     * \brief 丢弃镜像并从存储重新加载。
     */
    pub fn reload(&mut self) -> Result<()> {
        self.items = db::list_vocabulary(&self.conn)?;
        Ok(())
    }

    fn upsert_mirror(&mut self, item: VocabularyItem) {
        match self.items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
    }
}
