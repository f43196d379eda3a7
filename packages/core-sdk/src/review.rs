use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use rand::{seq::SliceRandom, Rng};
use rusqlite::Connection;

use crate::{
    db,
    llm::{ChatClient, CompletionRequest},
    models::{timestamp_now, ChatMessage, ReviewRecord, VocabularyItem},
    telemetry,
    vocabulary::VocabularyBook,
};

/** \brief 每次复习练习选取的生词数 */
pub const REVIEW_WORD_LIMIT: usize = 5;

pub const ANSWERS_BEGIN: &str = "---ANSWERS_BEGIN---";
pub const ANSWERS_END: &str = "---ANSWERS_END---";

const REVIEW_TEMPERATURE: f32 = 1.0;

const REVIEW_SYSTEM_PROMPT: &str = r#"
You are an English teacher writing a personalized review exercise for a learner. You will receive vocabulary words the learner has studied before.

Write one engaging activity that checks the learner's grasp of these words. Pick a format that suits the words, for example fill-in-the-blank sentences, matching words to definitions, usage questions in context, a word relationship exercise, or a short story built around the words.

Rules:
1. Never present the words in the order they were given.
2. Give clear instructions and keep the activity interactive.
3. When the exercise has definite answers, put them at the very end between these two marker lines, each on its own line and written exactly like this:

---ANSWERS_BEGIN---
answers here
---ANSWERS_END---

Use markdown. If fewer than three words are given, make a simpler activity that goes deeper on each word.
"#;

/**
 * \brief 选出复习次数最少的生词。
 * \details 按 `review_count` 分组、组内洗牌，从次数最低的组依次取满 `limit` 个。
 * 任何未选中的条目的复习次数都不低于已选中的条目。
 */
pub fn select_for_review<R>(
    items: &[VocabularyItem],
    limit: usize,
    rng: &mut R,
) -> Vec<VocabularyItem>
where
    R: Rng + ?Sized,
{
    let mut groups: BTreeMap<u32, Vec<&VocabularyItem>> = BTreeMap::new();
    for item in items {
        groups.entry(item.review_count).or_default().push(item);
    }

    let mut selected = Vec::with_capacity(limit.min(items.len()));
    for (_, mut group) in groups {
        let remaining = limit - selected.len();
        if remaining == 0 {
            break;
        }
        group.shuffle(rng);
        selected.extend(group.into_iter().take(remaining).cloned());
    }
    selected
}

/**
 * \brief 构造复习练习请求。
 */
pub fn review_request(selected: &[VocabularyItem], model: &str) -> CompletionRequest {
    let words = selected
        .iter()
        .map(|item| item.word.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    CompletionRequest {
        messages: vec![
            ChatMessage::system(REVIEW_SYSTEM_PROMPT.trim()),
            ChatMessage::user(format!(
                "Create a review exercise using these vocabulary words: {}",
                words
            )),
        ],
        model: model.to_string(),
        temperature: Some(REVIEW_TEMPERATURE),
    }
}

/**
 * \brief 生成一份复习练习。
 * \details 流正常结束后才在同一事务中保存练习并给所选生词的复习次数加一；
 * 任一步失败时不保存，复习次数不变。
 */
pub async fn generate_review<C>(
    client: &ChatClient,
    model: &str,
    book: &mut VocabularyBook,
    mut on_content: C,
) -> Result<ReviewRecord>
where
    C: FnMut(&str),
{
    if book.is_empty() {
        bail!("Please add some vocabulary words first to generate a review.");
    }

    let selected = {
        let mut rng = rand::thread_rng();
        select_for_review(book.items(), REVIEW_WORD_LIMIT, &mut rng)
    };
    let ids: Vec<i64> = selected.iter().map(|item| item.id).collect();
    let request = review_request(&selected, model);

    let mut content = String::new();
    client
        .chat_completion(
            &request,
            |delta| {
                content.push_str(delta);
                on_content(delta);
            },
            || telemetry::log_event("review.finish", &format!("ids={:?}", ids)),
        )
        .await
        .context("generate review failed")?;

    let timestamp = timestamp_now();
    let id = book
        .record_review(&content, timestamp, &ids)
        .context("save review failed")?;

    Ok(ReviewRecord {
        id,
        content,
        timestamp,
        vocabulary_ids: ids,
    })
}

/**
 * \brief 最近一次生成的复习练习。
 */
pub fn latest_review(conn: &Connection) -> Result<Option<ReviewRecord>> {
    db::latest_review(conn)
}

/**
 * \brief 全部复习练习，最新在前。
 */
pub fn review_history(conn: &Connection) -> Result<Vec<ReviewRecord>> {
    db::list_reviews(conn)
}

/**
 * \brief 练习正文与答案段的拆分视图。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewSheet<'a> {
    pub exercise: &'a str,
    /** \brief 含起止标记的答案段；缺少任一标记或顺序颠倒时为 None */
    pub answers: Option<&'a str>,
}

impl<'a> ReviewSheet<'a> {
    pub fn parse(content: &'a str) -> Self {
        let start = content.find(ANSWERS_BEGIN);
        let end = content.find(ANSWERS_END);
        if let (Some(start), Some(end)) = (start, end) {
            if end > start {
                return Self {
                    exercise: &content[..start],
                    answers: Some(&content[start..end + ANSWERS_END.len()]),
                };
            }
        }
        Self {
            exercise: content,
            answers: None,
        }
    }

    pub fn render(&self, show_answers: bool) -> String {
        match self.answers {
            Some(answers) if show_answers => format!("{}\n\n{}", self.exercise, answers),
            _ => self.exercise.to_string(),
        }
    }
}
