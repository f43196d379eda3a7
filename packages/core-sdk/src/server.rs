use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, get_service},
    Json, Router,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::{
    config::AppConfig,
    db,
    detail::{self, DetailSource},
    llm::{self, ChatClient},
    models::{ReviewRecord, VocabularyItem},
    review::{self, ReviewSheet},
    settings::{self, SettingKey, Settings},
    telemetry,
    vocabulary::{AddedWord, VocabularyBook},
};

type ApiError = (StatusCode, String);
type SharedConfig = Arc<AppConfig>;

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, config: AppConfig) -> Result<()> {
    let conn = db::open_db(&config.db_path)?;
    db::migrate(&conn)?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);
    drop(conn);

    let app = router(config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装 API 路由；未匹配的路径交给静态目录。
 */
pub fn router(config: AppConfig) -> Router {
    let static_service =
        get_service(ServeDir::new(&config.ui_dir).append_index_html_on_directories(true));

    Router::new()
        .route("/api/settings", get(get_settings).post(set_settings))
        .route("/api/vocabulary", get(list_vocabulary).post(add_vocabulary))
        .route("/api/vocabulary/{id}", delete(remove_vocabulary))
        .route("/api/vocabulary/{id}/detail/sse", get(detail_sse))
        .route("/api/review/sse", get(review_sse))
        .route("/api/reviews", get(list_reviews))
        .route("/api/reviews/latest", get(latest_review))
        .route("/api/health", get(health_check))
        .fallback_service(static_service)
        .with_state(Arc::new(config))
}

#[derive(Serialize, Debug)]
struct SettingsState {
    /** \brief 脱敏后的 API Key */
    openai_api_key: String,
    has_api_key: bool,
    /** \brief 用户保存的模型名 */
    openai_model: String,
    /** \brief 实际使用的模型 */
    model: &'static str,
    models: &'static [&'static str],
    telemetry_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct SettingsInput {
    #[serde(default)]
    key: Option<SettingKey>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    telemetry_enabled: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct WordInput {
    word: String,
}

#[derive(Serialize, Debug)]
struct VocabularyList {
    items: Vec<VocabularyItem>,
}

#[derive(Serialize, Debug)]
struct AddedWordDto {
    item: VocabularyItem,
    created: bool,
}

#[derive(Serialize, Debug)]
struct ReviewDto {
    id: i64,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    vocabulary_ids: Vec<i64>,
    exercise: String,
    answers: Option<String>,
}

impl From<ReviewRecord> for ReviewDto {
    fn from(record: ReviewRecord) -> Self {
        let sheet = ReviewSheet::parse(&record.content);
        Self {
            id: record.id,
            timestamp: record.timestamp,
            exercise: sheet.exercise.to_string(),
            answers: sheet.answers.map(str::to_string),
            vocabulary_ids: record.vocabulary_ids,
        }
    }
}

#[derive(Serialize, Debug)]
struct LatestReview {
    review: Option<ReviewDto>,
}

#[derive(Serialize, Debug)]
struct ReviewList {
    reviews: Vec<ReviewDto>,
}

fn open(config: &AppConfig) -> Result<Connection, ApiError> {
    db::open_db(&config.db_path).map_err(internal_err)
}

fn build_settings_state(conn: &Connection) -> Result<SettingsState> {
    let settings = Settings::load(conn)?;
    let telemetry_enabled = db::get_telemetry_enabled(conn)?;
    telemetry::set_enabled(telemetry_enabled);
    Ok(SettingsState {
        openai_api_key: settings.masked_api_key(),
        has_api_key: settings.has_api_key(),
        model: settings.model(),
        openai_model: settings.openai_model,
        models: llm::GPT_MODELS,
        telemetry_enabled,
    })
}

fn vocabulary_list(book: &VocabularyBook) -> VocabularyList {
    VocabularyList {
        items: book.sorted_by_recent().into_iter().cloned().collect(),
    }
}

/**
 * \brief 获取当前设置（API Key 脱敏）。
 */
async fn get_settings(
    State(config): State<SharedConfig>,
) -> Result<Json<SettingsState>, ApiError> {
    let conn = open(&config)?;
    let state = build_settings_state(&conn).map_err(internal_err)?;
    Ok(Json(state))
}

/**
 * \brief 修改单个设置项和/或遥测开关。
 */
async fn set_settings(
    State(config): State<SharedConfig>,
    Json(input): Json<SettingsInput>,
) -> Result<Json<SettingsState>, ApiError> {
    let conn = open(&config)?;
    match (input.key, input.value) {
        (Some(key), Some(value)) => {
            let current = Settings::load(&conn).map_err(internal_err)?;
            settings::store_setting(&conn, &current, key, &value).map_err(internal_err)?;
            telemetry::log_event("server.settings", &format!("update key={}", key.as_str()));
        }
        (Some(_), None) => return Err(bad_request("value is required")),
        _ => {}
    }
    if let Some(enabled) = input.telemetry_enabled {
        db::set_telemetry_enabled(&conn, enabled).map_err(internal_err)?;
        telemetry::set_enabled(enabled);
    }
    let state = build_settings_state(&conn).map_err(internal_err)?;
    Ok(Json(state))
}

/**
 * \brief 生词列表，最近录入在前。
 */
async fn list_vocabulary(
    State(config): State<SharedConfig>,
) -> Result<Json<VocabularyList>, ApiError> {
    let book = VocabularyBook::load(open(&config)?).map_err(internal_err)?;
    Ok(Json(vocabulary_list(&book)))
}

async fn add_vocabulary(
    State(config): State<SharedConfig>,
    Json(input): Json<WordInput>,
) -> Result<Json<AddedWordDto>, ApiError> {
    if input.word.trim().is_empty() {
        return Err(bad_request("word must not be empty"));
    }
    let mut book = VocabularyBook::load(open(&config)?).map_err(internal_err)?;
    let AddedWord { item, created } = book.add_word(&input.word).map_err(internal_err)?;
    Ok(Json(AddedWordDto { item, created }))
}

async fn remove_vocabulary(
    State(config): State<SharedConfig>,
    Path(id): Path<i64>,
) -> Result<Json<VocabularyList>, ApiError> {
    let mut book = VocabularyBook::load(open(&config)?).map_err(internal_err)?;
    if book.get(id).is_none() {
        return Err(not_found(format!("vocabulary id {} not found", id)));
    }
    book.delete(id).map_err(internal_err)?;
    Ok(Json(vocabulary_list(&book)))
}

/**
 * \brief 最近一次复习练习，正文与答案分开返回。
 */
async fn latest_review(
    State(config): State<SharedConfig>,
) -> Result<Json<LatestReview>, ApiError> {
    let conn = open(&config)?;
    let review = review::latest_review(&conn)
        .map_err(internal_err)?
        .map(ReviewDto::from);
    Ok(Json(LatestReview { review }))
}

/**
 * \brief 复习练习历史，最新在前。
 */
async fn list_reviews(State(config): State<SharedConfig>) -> Result<Json<ReviewList>, ApiError> {
    let conn = open(&config)?;
    let reviews = review::review_history(&conn)
        .map_err(internal_err)?
        .into_iter()
        .map(ReviewDto::from)
        .collect();
    Ok(Json(ReviewList { reviews }))
}

async fn health_check(
    State(config): State<SharedConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = open(&config)?;
    let settings = Settings::load(&conn).map_err(internal_err)?;
    let words = db::list_vocabulary(&conn).map_err(internal_err)?.len();
    Ok(Json(serde_json::json!({
        "ok": true,
        "has_api_key": settings.has_api_key(),
        "model": settings.model(),
        "base": config.api_base,
        "vocabulary": words,
    })))
}

/**
 * \brief 准备流式调用所需的生词本与客户端；缺少 API Key 时在建立 SSE 之前报错。
 */
fn prepare_stream(
    config: &AppConfig,
) -> Result<(VocabularyBook, ChatClient, &'static str), ApiError> {
    let conn = open(config)?;
    telemetry::set_enabled(db::get_telemetry_enabled(&conn).map_err(internal_err)?);
    let settings = Settings::load(&conn).map_err(internal_err)?;
    let client = ChatClient::from_settings(&settings, config).map_err(bad_request)?;
    let book = VocabularyBook::load(conn).map_err(internal_err)?;
    Ok((book, client, settings.model()))
}

/**
 * \brief SSE 数据行不能包含 CR。
 */
fn data_event(text: &str) -> Event {
    Event::default().data(text.replace('\r', ""))
}

fn error_event(err: &anyhow::Error) -> Event {
    data_event(&format!("{:#}", err)).event("error")
}

/**
 * \brief 单词讲解 SSE：GET /api/vocabulary/{id}/detail/sse
 * \details 事件顺序为 meta、若干无名数据事件、done；失败时以 error 事件结束。
 */
async fn detail_sse(
    State(config): State<SharedConfig>,
    Path(id): Path<i64>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (mut book, client, model) = prepare_stream(&config)?;
    let word = book
        .get(id)
        .map(|item| item.word.clone())
        .ok_or_else(|| not_found(format!("vocabulary id {} not found", id)))?;

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default()
        .event("meta")
        .data(serde_json::json!({ "id": id, "word": word, "model": model }).to_string())));

    tokio::spawn(async move {
        telemetry::log_event("server.detail", &format!("id={} word={}", id, word));
        let stream_tx = tx.clone();
        let result = detail::explain_word(&client, model, &mut book, id, move |delta| {
            let _ = stream_tx.send(Ok(data_event(delta)));
        })
        .await;

        match result {
            Ok(found) => {
                if found.source == DetailSource::Cached {
                    let _ = tx.send(Ok(data_event(&found.text)));
                }
                let source = match found.source {
                    DetailSource::Cached => "cached",
                    DetailSource::Generated => "generated",
                };
                let _ = tx.send(Ok(Event::default()
                    .event("done")
                    .data(serde_json::json!({ "source": source }).to_string())));
            }
            Err(e) => {
                telemetry::log_error("server.detail", &format!("id={} error={:#}", id, e));
                let _ = tx.send(Ok(error_event(&e)));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

/**
 * \brief 复习练习 SSE：GET /api/review/sse
 * \details 完成后 done 事件携带保存的练习 ID 与所选生词 ID。
 */
async fn review_sse(
    State(config): State<SharedConfig>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (mut book, client, model) = prepare_stream(&config)?;
    if book.is_empty() {
        return Err(bad_request(
            "Please add some vocabulary words first to generate a review.",
        ));
    }

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    tokio::spawn(async move {
        let stream_tx = tx.clone();
        let result = review::generate_review(&client, model, &mut book, move |delta| {
            let _ = stream_tx.send(Ok(data_event(delta)));
        })
        .await;

        match result {
            Ok(record) => {
                let _ = tx.send(Ok(Event::default().event("done").data(
                    serde_json::json!({
                        "id": record.id,
                        "vocabulary_ids": record.vocabulary_ids,
                    })
                    .to_string(),
                )));
            }
            Err(e) => {
                telemetry::log_error("server.review", &format!("error={:#}", e));
                let _ = tx.send(Ok(error_event(&e)));
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}

fn not_found<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::NOT_FOUND, e.to_string())
}
