use std::{pin::Pin, time::Duration};

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    StatusCode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::AppConfig,
    models::ChatMessage,
    settings::Settings,
    sse::{EventParser, Utf8Decoder},
    telemetry,
};

/** \brief 允许使用的模型列表。 */
pub const GPT_MODELS: &[&str] = &[
    "gpt-3.5-turbo-16k",
    "gpt-3.5-turbo",
    "gpt-4",
    "gpt-4-32k",
    "gpt-4o",
    "gpt-4o-mini",
    "gpt-4.1-nano",
];

/** \brief 所选模型不在列表中时使用的模型。 */
pub const DEFAULT_MODEL: &str = "gpt-4.1-nano";

pub const DEFAULT_API_BASE: &str = "https://api.openai.com";

const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief 把调用方选择的模型映射到允许列表，未知值退回默认模型。
 */
pub fn resolve_model(requested: &str) -> &'static str {
    GPT_MODELS
        .iter()
        .copied()
        .find(|model| *model == requested)
        .unwrap_or(DEFAULT_MODEL)
}

/**
 * \brief 流式补全的错误分类；均不在本层重试。
 */
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("OpenAI API key is missing. Please set it in the settings.")]
    MissingApiKey,
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("malformed stream payload `{payload}`: {source}")]
    Protocol {
        payload: String,
        #[source]
        source: serde_json::Error,
    },
}

/**
 * \brief 一次补全请求的数据部分；回调在调用时单独传入。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /** \brief 调用方选择的模型，发送前经 `resolve_model` 校验 */
    pub model: String,
    pub temperature: Option<f32>,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/** \brief 按到达顺序产出的增量文本流。 */
type DeltaStream<'a> = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send + 'a>>;

/**
 * \brief Chat Completions 流式客户端，构造时绑定凭据，调用之间不共享可变状态。
 */
#[derive(Debug, Clone)]
pub struct ChatClient {
    api_key: String,
    api_base: String,
    http: reqwest::Client,
}

impl ChatClient {
    /**
     * \brief 构造客户端；缺少 API Key 时在任何网络请求之前失败。
     */
    pub fn new(
        api_key: &str,
        api_base: &str,
        connect_timeout: Option<Duration>,
    ) -> Result<Self, ChatError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        Self::with_http(api_key, api_base, builder.build()?)
    }

    pub fn from_settings(settings: &Settings, config: &AppConfig) -> Result<Self, ChatError> {
        Self::new(
            &settings.openai_api_key,
            &config.api_base,
            config.connect_timeout,
        )
    }

    pub(crate) fn with_http(
        api_key: &str,
        api_base: &str,
        http: reqwest::Client,
    ) -> Result<Self, ChatError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(ChatError::MissingApiKey);
        }
        Ok(Self {
            api_key: api_key.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.api_base)
    }

    /**
     * \brief 发起 `stream: true` 请求，返回增量文本流。
     * \details 非 200 状态直接返回带响应正文的错误，不产生任何增量。
     */
    async fn stream_chat(
        &self,
        request: &CompletionRequest,
    ) -> Result<DeltaStream<'static>, ChatError> {
        let model = resolve_model(&request.model);
        let body = CompletionBody {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            stream: true,
        };

        let resp = self
            .http
            .post(self.completions_url())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if resp.status() != StatusCode::OK {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Http { status, body });
        }

        Ok(decode_event_stream(resp.bytes_stream()))
    }

    /**
     * \brief 流式补全：每个增量调用一次 `on_content`，流正常结束后调用一次 `on_finish`。
     * \details 出错时已送出的增量不会撤回，调用方应丢弃这部分临时文本。
     */
    pub async fn chat_completion<C, F>(
        &self,
        request: &CompletionRequest,
        on_content: C,
        on_finish: F,
    ) -> Result<(), ChatError>
    where
        C: FnMut(&str),
        F: FnOnce(),
    {
        let model = resolve_model(&request.model);
        telemetry::log_event(
            "llm.chat",
            &format!("model={} messages={}", model, request.messages.len()),
        );
        let result = match self.stream_chat(request).await {
            Ok(deltas) => deliver(deltas, on_content, on_finish).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            telemetry::log_error("llm.chat", &format!("model={} error={}", model, e));
        }
        result
    }
}

/**
 * \brief 把增量流交给回调；`on_finish` 只在流无错结束时调用，且晚于最后一次 `on_content`。
 */
async fn deliver<C, F>(
    mut deltas: DeltaStream<'_>,
    mut on_content: C,
    on_finish: F,
) -> Result<(), ChatError>
where
    C: FnMut(&str),
    F: FnOnce(),
{
    while let Some(delta) = deltas.next().await {
        let delta = delta?;
        on_content(&delta);
    }
    on_finish();
    Ok(())
}

/**
 * \brief 把原始字节流解析为增量文本流。
 * \details 字节块边界可以落在帧、行或多字节字符中间；`[DONE]` 被消费但不产出内容。
 * 读句柄归返回的流所有，流被丢弃时随之释放。
 */
fn decode_event_stream<'a, S, B, E>(body: S) -> DeltaStream<'a>
where
    S: Stream<Item = Result<B, E>> + Send + 'a,
    B: AsRef<[u8]> + Send + 'a,
    E: Into<ChatError> + Send + 'a,
{
    let out = try_stream! {
        let mut body = Box::pin(body);
        let mut decoder = Utf8Decoder::new();
        let mut parser = EventParser::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(Into::<ChatError>::into)?;
            let text = decoder.decode(chunk.as_ref());
            for event in parser.feed(&text) {
                if let Some(delta) = parse_frame(&event.data)? {
                    yield delta;
                }
            }
        }
        let tail = decoder.finish();
        let mut events = parser.feed(&tail);
        events.extend(parser.finish());
        for event in events {
            if let Some(delta) = parse_frame(&event.data)? {
                yield delta;
            }
        }
    };
    Box::pin(out)
}

/**
 * \brief 解析单帧 `data`：哨兵返回 None，缺失的 content 视为空串，空 choices 视为协议错误。
 */
fn parse_frame(data: &str) -> Result<Option<String>, ChatError> {
    if data.trim() == DONE_SENTINEL {
        return Ok(None);
    }
    let protocol = |source: serde_json::Error| ChatError::Protocol {
        payload: data.to_string(),
        source,
    };
    let chunk: CompletionChunk = serde_json::from_str(data).map_err(protocol)?;
    let choice = chunk.choices.into_iter().next().ok_or_else(|| {
        protocol(<serde_json::Error as serde::de::Error>::custom(
            "choices is empty",
        ))
    })?;
    Ok(Some(choice.delta.content.unwrap_or_default()))
}
