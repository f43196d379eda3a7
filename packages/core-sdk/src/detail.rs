use anyhow::{anyhow, Context, Result};

use crate::{
    llm::{ChatClient, CompletionRequest},
    models::ChatMessage,
    telemetry,
    vocabulary::VocabularyBook,
};

const DETAIL_TEMPERATURE: f32 = 1.0;

const DETAIL_SYSTEM_PROMPT: &str = r#"
You are an English vocabulary teacher preparing notes for learners whose first language is Traditional Chinese (zh-TW). The user sends one word wrapped in triple hash signs. Explain it so the learner understands and remembers it:

- American English pronunciation in IPA.
- Etymology, told as a short story or context that helps memory.
- Translation into Mandarin Chinese (Taiwan), with nuances where relevant.
- Example sentences in varied contexts, at least one drawn from life in Taiwan.
- Near-synonyms and how their usage differs.
- Common collocations and phrases.
- A mnemonic tip or reflective question.

Format the answer in markdown. Start directly with the explanation: no greeting, no closing remarks, and no title repeating the word.
"#;

/**
 * \brief 讲解的来源。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailSource {
    /** \brief 读取自本地缓存，未发起网络请求 */
    Cached,
    /** \brief 本次流式生成并已缓存 */
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordDetail {
    pub text: String,
    pub source: DetailSource,
}

/**
 * \brief 构造单词讲解请求。
 */
pub fn detail_request(word: &str, model: &str) -> CompletionRequest {
    CompletionRequest {
        messages: vec![
            ChatMessage::system(DETAIL_SYSTEM_PROMPT.trim()),
            ChatMessage::user(format!("###{}###", word)),
        ],
        model: model.to_string(),
        temperature: Some(DETAIL_TEMPERATURE),
    }
}

/**
 * \brief 获取单词讲解：有缓存直接返回，否则流式生成并在完成后写入缓存。
 * \details 生成失败时不写缓存，已通过 `on_content` 送出的片段由调用方丢弃。
 */
pub async fn explain_word<C>(
    client: &ChatClient,
    model: &str,
    book: &mut VocabularyBook,
    id: i64,
    mut on_content: C,
) -> Result<WordDetail>
where
    C: FnMut(&str),
{
    let item = book
        .get(id)
        .cloned()
        .ok_or_else(|| anyhow!("vocabulary id {} not found", id))?;

    if let Some(detail) = item.detail.filter(|d| !d.is_empty()) {
        return Ok(WordDetail {
            text: detail,
            source: DetailSource::Cached,
        });
    }

    let request = detail_request(&item.word, model);
    let mut text = String::new();
    client
        .chat_completion(
            &request,
            |delta| {
                text.push_str(delta);
                on_content(delta);
            },
            || telemetry::log_event("detail.finish", &format!("word={}", item.word)),
        )
        .await
        .with_context(|| format!("generate detail for `{}` failed", item.word))?;

    if !text.is_empty() {
        book.set_detail(id, &text).context("save detail failed")?;
    }
    Ok(WordDetail {
        text,
        source: DetailSource::Generated,
    })
}

const QUESTION_SYSTEM_PROMPT: &str = "You are a helpful English tutor for learners whose first language is Traditional Chinese (zh-TW). Answer questions about the word the learner is studying, concisely and in markdown.";

/**
 * \brief 针对单词的单轮提问；已有讲解时作为上一轮助手回复放入上下文。不保存对话。
 */
pub fn question_request(
    word: &str,
    detail: Option<&str>,
    question: &str,
    model: &str,
) -> CompletionRequest {
    let mut messages = vec![
        ChatMessage::system(QUESTION_SYSTEM_PROMPT),
        ChatMessage::user(format!("###{}###", word)),
    ];
    if let Some(detail) = detail.filter(|d| !d.is_empty()) {
        messages.push(ChatMessage::assistant(detail));
    }
    messages.push(ChatMessage::user(question));
    CompletionRequest {
        messages,
        model: model.to_string(),
        temperature: Some(DETAIL_TEMPERATURE),
    }
}

pub async fn ask_about_word<C>(
    client: &ChatClient,
    model: &str,
    book: &VocabularyBook,
    id: i64,
    question: &str,
    mut on_content: C,
) -> Result<String>
where
    C: FnMut(&str),
{
    let item = book
        .get(id)
        .ok_or_else(|| anyhow!("vocabulary id {} not found", id))?;
    let request = question_request(&item.word, item.detail.as_deref(), question, model);
    let mut answer = String::new();
    client
        .chat_completion(
            &request,
            |delta| {
                answer.push_str(delta);
                on_content(delta);
            },
            || {},
        )
        .await
        .with_context(|| format!("question about `{}` failed", item.word))?;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::tests::mem_conn, models::Role, testing::provider_with_deltas};

    #[test]
    fn test_detail_request_shape() {
        let request = detail_request("quixotic", "gpt-4o");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].content, "###quixotic###");
        assert_eq!(request.model, "gpt-4o");
        assert_eq!(request.temperature, Some(1.0));
    }

    #[test]
    fn test_question_request_uses_detail_as_context() {
        let request = question_request(
            "lucid",
            Some("clear, easy to understand"),
            "Is it formal?",
            "gpt-4o",
        );
        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(request.messages[1].content, "###lucid###");
        assert_eq!(request.messages[2].content, "clear, easy to understand");
        assert_eq!(request.messages[3].content, "Is it formal?");

        let request = question_request("lucid", None, "?", "gpt-4o");
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[2].role, Role::User);
    }

    #[tokio::test]
    async fn test_cached_detail_skips_network() {
        let mut book = VocabularyBook::load(mem_conn()).expect("book");
        let id = book.add_word("laconic").expect("add").item.id;
        book.set_detail(id, "using few words").expect("detail");

        // 不可达地址：若发起请求必然失败
        let client = ChatClient::new("sk-test", "http://127.0.0.1:9", None).expect("client");
        let mut streamed = 0;
        let detail = explain_word(&client, "gpt-4o", &mut book, id, |_| streamed += 1)
            .await
            .expect("cached detail");
        assert_eq!(detail.source, DetailSource::Cached);
        assert_eq!(detail.text, "using few words");
        assert_eq!(streamed, 0);
    }

    #[tokio::test]
    async fn test_failed_generation_leaves_no_cache() {
        let mut book = VocabularyBook::load(mem_conn()).expect("book");
        let id = book.add_word("ephemeral").expect("add").item.id;
        let client = ChatClient::new("sk-test", "http://127.0.0.1:9", None).expect("client");

        let result = explain_word(&client, "gpt-4o", &mut book, id, |_| {}).await;
        assert!(result.is_err());
        assert_eq!(book.get(id).and_then(|i| i.detail.clone()), None);
    }

    #[tokio::test]
    async fn test_generated_detail_is_cached_after_stream() {
        let (fake, client) = provider_with_deltas(&["**lucid** /ˈluːsɪd/", " 清楚的"]).await;
        let mut book = VocabularyBook::load(mem_conn()).expect("book");
        let id = book.add_word("lucid").expect("add").item.id;

        let mut streamed = String::new();
        let detail = explain_word(&client, "gpt-4o", &mut book, id, |d| streamed.push_str(d))
            .await
            .expect("detail");
        assert_eq!(detail.source, DetailSource::Generated);
        assert_eq!(detail.text, "**lucid** /ˈluːsɪd/ 清楚的");
        assert_eq!(streamed, detail.text);
        assert_eq!(fake.last_body().expect("request")["messages"][1]["content"], "###lucid###");

        book.reload().expect("reload");
        assert_eq!(book.get(id).and_then(|i| i.detail.clone()), Some(detail.text.clone()));

        let again = explain_word(&client, "gpt-4o", &mut book, id, |_| {})
            .await
            .expect("cached");
        assert_eq!(again.source, DetailSource::Cached);
        assert_eq!(fake.request_count(), 1);
    }

    #[tokio::test]
    async fn test_ask_about_word_streams_answer() {
        let (fake, client) = provider_with_deltas(&["Yes, ", "fairly formal."]).await;
        let mut book = VocabularyBook::load(mem_conn()).expect("book");
        let id = book.add_word("lucid").expect("add").item.id;
        book.set_detail(id, "clear").expect("detail");

        let answer = ask_about_word(&client, "gpt-4o", &book, id, "Is it formal?", |_| {})
            .await
            .expect("answer");
        assert_eq!(answer, "Yes, fairly formal.");
        let body = fake.last_body().expect("request");
        assert_eq!(body["messages"][2]["role"], "assistant");
        assert_eq!(body["messages"][2]["content"], "clear");
        assert_eq!(body["messages"][3]["content"], "Is it formal?");
    }
}
