//! End-to-end tests of the HTTP API against in-process backends.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use memchat_core::chat::{ChatMessage, TokenStream, APOLOGY};
use memchat_core::memory::{HashingEmbedder, IndexSpec, InMemoryIndex, Metric};
use memchat_core::{
    ChatModel, ChatService, ChatSettings, Dispatcher, HistoryStore, JobQueue, MemchatError,
    MemoryManager, RememberWorker, Result, WorkerPool,
};
use memchat_server::{router, AppState, CONVERSATION_ID_HEADER};

const DIM: usize = 64;

/// Answers every prompt with the same script
struct ScriptedModel(Vec<Result<String>>);

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, _messages: Vec<ChatMessage>) -> Result<TokenStream> {
        Ok(stream::iter(self.0.clone()).boxed())
    }
}

struct TestApp {
    app: Router,
    index: Arc<InMemoryIndex>,
    _pool: WorkerPool,
    _dir: TempDir,
}

async fn spawn_app(script: Vec<Result<String>>) -> TestApp {
    let dir = TempDir::new().unwrap();
    let history = Arc::new(HistoryStore::open(Some(&dir.path().join("history.redb"))).unwrap());
    let queue = Arc::new(JobQueue::open(&dir.path().join("broker.redb")).unwrap());
    let index = Arc::new(InMemoryIndex::new(IndexSpec::new("test", DIM, Metric::Cosine)));
    let memory = Arc::new(
        MemoryManager::new(index.clone(), Arc::new(HashingEmbedder::new(DIM)))
            .await
            .unwrap(),
    );

    let (dispatcher, rx) = Dispatcher::new(queue.clone());
    let worker = Arc::new(RememberWorker::new(history.clone(), Some(memory.clone())));
    let pool = WorkerPool::start(queue, rx, worker, 2).unwrap();

    let chat = Arc::new(ChatService::new(
        history,
        Some(memory),
        dispatcher.clone(),
        Arc::new(ScriptedModel(script)),
        ChatSettings::default(),
    ));
    let app = router(AppState::new(chat, dispatcher), "http://localhost:3000");

    TestApp {
        app,
        index,
        _pool: pool,
        _dir: dir,
    }
}

fn tokens(parts: &[&str]) -> Vec<Result<String>> {
    parts.iter().map(|p| Ok(p.to_string())).collect()
}

async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_text(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = send(app, Request::get(uri).body(Body::empty()).unwrap()).await;
    let status = response.status();
    let text = body_text(response).await;
    (status, serde_json::from_str(&text).unwrap_or(Value::Null))
}

fn post_chat(body: Value) -> Request<Body> {
    Request::post("/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Poll until the background workers have caught up
async fn eventually<F>(mut check: F)
where
    F: FnMut() -> futures_util::future::BoxFuture<'static, bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn root_redirects_to_docs() {
    let t = spawn_app(tokens(&["hi"])).await;
    let response = send(&t.app, Request::get("/").body(Body::empty()).unwrap()).await;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()["location"], "/docs");

    let (status, docs) = get_json(&t.app, "/docs").await;
    assert_eq!(status, StatusCode::OK);
    assert!(docs["routes"].as_array().unwrap().len() >= 5);
}

#[tokio::test]
async fn conversations_start_empty() {
    let t = spawn_app(tokens(&["hi"])).await;
    let (status, body) = get_json(&t.app, "/conversations").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn chat_streams_and_titles_conversation() {
    let t = spawn_app(tokens(&["Gradient descent ", "walks downhill."])).await;

    let response = send(
        &t.app,
        post_chat(json!({ "user_input": "Explain gradient descent", "user_id": "u1" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        "text/plain; charset=utf-8"
    );
    let conversation_id: u64 = response.headers()[CONVERSATION_ID_HEADER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(body_text(response).await, "Gradient descent walks downhill.");

    let app = t.app.clone();
    eventually(move || {
        let app = app.clone();
        Box::pin(async move {
            let (_, list) = get_json(&app, "/conversations?user_id=u1").await;
            list[0]["title"] == "Explain gradient descent"
        })
    })
    .await;

    let (_, list) = get_json(&t.app, "/conversations?user_id=u1").await;
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"], conversation_id);

    let app = t.app.clone();
    let uri = format!("/history/{}", conversation_id);
    eventually(move || {
        let app = app.clone();
        let uri = uri.clone();
        Box::pin(async move {
            let (status, history) = get_json(&app, &uri).await;
            status == StatusCode::OK && history.as_array().map_or(0, |h| h.len()) == 2
        })
    })
    .await;

    let (_, history) = get_json(&t.app, &format!("/history/{}", conversation_id)).await;
    assert_eq!(history[0]["role"], "user");
    assert_eq!(history[0]["content"], "Explain gradient descent");
    assert_eq!(history[1]["role"], "assistant");
    assert_eq!(history[1]["content"], "Gradient descent walks downhill.");

    let index = t.index.clone();
    eventually(move || {
        let index = index.clone();
        Box::pin(async move { index.len("u1").await == 2 })
    })
    .await;
}

#[tokio::test]
async fn user_id_header_scopes_conversation() {
    let t = spawn_app(tokens(&["Hello!"])).await;

    let request = Request::post("/chat")
        .header("content-type", "application/json")
        .header("X-User-ID", "test_user_42")
        .body(Body::from(
            json!({ "user_input": "Test query for new chat", "conversation_id": null }).to_string(),
        ))
        .unwrap();
    let response = send(&t.app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Hello!");

    let (_, mine) = get_json(&t.app, "/conversations?user_id=test_user_42").await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
    let (_, theirs) = get_json(&t.app, "/conversations?user_id=someone_else").await;
    assert_eq!(theirs, json!([]));
}

#[tokio::test]
async fn unknown_history_is_404() {
    let t = spawn_app(tokens(&["hi"])).await;
    let (status, body) = get_json(&t.app, "/history/999999").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn empty_input_is_rejected() {
    let t = spawn_app(tokens(&["hi"])).await;
    let response = send(&t.app, post_chat(json!({ "user_input": "   " }))).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(body, json!({ "error": "Empty input." }));
}

#[tokio::test]
async fn unknown_conversation_is_404() {
    let t = spawn_app(tokens(&["hi"])).await;
    let response = send(
        &t.app,
        post_chat(json!({ "user_input": "hello", "conversation_id": 31337 })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn model_failure_appends_apology() {
    let t = spawn_app(vec![
        Ok("Half an ans".to_string()),
        Err(MemchatError::Generation("connection reset".into())),
    ])
    .await;

    let response = send(&t.app, post_chat(json!({ "user_input": "hello", "user_id": "u1" }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_text(response).await,
        format!("Half an ans{}", APOLOGY)
    );
}

#[tokio::test]
async fn health_and_memory_purge() {
    let t = spawn_app(tokens(&["noted"])).await;

    let (status, health) = get_json(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["memory"]["status"], "connected");

    let response = send(&t.app, post_chat(json!({ "user_input": "remember me", "user_id": "u9" }))).await;
    body_text(response).await;

    let index = t.index.clone();
    eventually(move || {
        let index = index.clone();
        Box::pin(async move { index.len("u9").await == 2 })
    })
    .await;

    let response = send(
        &t.app,
        Request::delete("/memories/u9").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(t.index.len("u9").await, 0);
}
