//! 测试用的本地假 Provider。

use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    http::{header, HeaderMap},
    response::Response,
    routing::post,
    Json, Router,
};
use futures_util::stream;
use serde_json::{json, Value};

use crate::llm::ChatClient;

/**
 * \brief 记录收到的请求（Authorization 头, JSON 请求体）。
 */
#[derive(Clone, Default)]
pub(crate) struct FakeProvider {
    pub requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

impl FakeProvider {
    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("lock requests").len()
    }

    pub fn last_body(&self) -> Option<Value> {
        self.requests
            .lock()
            .expect("lock requests")
            .last()
            .map(|(_, body)| body.clone())
    }
}

/**
 * \brief 生成一帧 `data: {...}\n\n`。
 */
pub(crate) fn delta_frame(content: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "delta": { "content": content } }] })
    )
}

/**
 * \brief 由增量列表拼出完整响应体，末尾带 `[DONE]`。
 */
pub(crate) fn sse_body(deltas: &[&str]) -> String {
    let mut body: String = deltas.iter().map(|d| delta_frame(d)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

/**
 * \brief 对每个请求按给定分块返回同一响应体的路由。
 */
pub(crate) fn streaming_router(fake: FakeProvider, chunks: Vec<Vec<u8>>) -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(move |headers: HeaderMap, Json(body): Json<Value>| {
            let fake = fake.clone();
            let chunks = chunks.clone();
            async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                fake.requests.lock().expect("lock requests").push((auth, body));
                let body = Body::from_stream(stream::iter(
                    chunks.into_iter().map(Ok::<_, std::io::Error>),
                ));
                Response::builder()
                    .header(header::CONTENT_TYPE, "text/event-stream")
                    .body(body)
                    .expect("build response")
            }
        }),
    )
}

pub(crate) async fn spawn_provider(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake provider");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("serve fake provider");
    });
    format!("http://{}", addr)
}

/**
 * \brief 启动返回给定增量的假 Provider，并给出指向它的客户端。
 */
pub(crate) async fn provider_with_deltas(deltas: &[&str]) -> (FakeProvider, ChatClient) {
    let fake = FakeProvider::default();
    let body = sse_body(deltas).into_bytes();
    let chunks = body.chunks(7).map(|c| c.to_vec()).collect();
    let base = spawn_provider(streaming_router(fake.clone(), chunks)).await;
    (fake, test_client(&base))
}

pub(crate) fn test_client(base: &str) -> ChatClient {
    let http = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("build http client");
    ChatClient::with_http("sk-test", base, http).expect("client")
}
