use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use storewatch::{
    AssistantError, CompletionRequest, CompletionService, Conversation, EntryKind,
    HttpCompletionService, LlmConfig, SessionStore, Turn, TurnRole,
};

#[derive(Clone, Default)]
struct FakeBackend {
    bodies: Arc<Mutex<Vec<Value>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
}

async fn completions(
    State(backend): State<FakeBackend>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> Json<Value> {
    let auth = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    backend.auth.lock().expect("auth lock").push(auth);
    let turns = body["messages"].as_array().map_or(0, Vec::len);
    backend.bodies.lock().expect("bodies lock").push(body);
    Json(json!({
        "choices": [
            { "message": { "role": "assistant", "content": format!("saw {turns} messages") } }
        ]
    }))
}

async fn overloaded() -> (StatusCode, Json<Value>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "overloaded" })),
    )
}

async fn spawn_backend(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("fake backend should serve");
    });
    addr
}

fn llm_config(addr: SocketAddr, api_key: Option<&str>) -> LlmConfig {
    LlmConfig {
        base_url: format!("http://{addr}/v1/"),
        model: "test-model".to_string(),
        api_key: api_key.map(str::to_string),
        timeout_ms: 5_000,
    }
}

async fn complete_blocking(
    cfg: LlmConfig,
    request: CompletionRequest,
) -> Result<String, AssistantError> {
    tokio::task::spawn_blocking(move || {
        let service = HttpCompletionService::new(&cfg)?;
        service.complete(&request)
    })
    .await
    .expect("blocking task should not panic")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_service_sends_system_history_and_question() {
    let backend = FakeBackend::default();
    let router = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(backend.clone());
    let addr = spawn_backend(router).await;

    let prior = vec![
        Turn {
            role: TurnRole::User,
            content: "when is the peak?".to_string(),
        },
        Turn {
            role: TurnRole::Model,
            content: "around 19:00".to_string(),
        },
    ];
    let request = CompletionRequest::new("=== DIGEST ===", &prior, "and the lowest hour?");

    let answer = complete_blocking(llm_config(addr, Some("secret")), request)
        .await
        .expect("completion should succeed");
    assert_eq!(answer, "saw 4 messages");

    let bodies = backend.bodies.lock().expect("bodies lock");
    let body = &bodies[0];
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["max_tokens"], 4096);
    let messages = body["messages"].as_array().expect("messages array");
    assert_eq!(messages[0]["role"], "system");
    assert!(messages[0]["content"]
        .as_str()
        .expect("system content")
        .ends_with("=== DIGEST ==="));
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[2]["role"], "assistant");
    assert_eq!(messages[3]["content"], "and the lowest hour?");

    let auth = backend.auth.lock().expect("auth lock");
    assert_eq!(auth[0].as_deref(), Some("Bearer secret"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_success_status_becomes_external_service_error() {
    let router = Router::new().route("/v1/chat/completions", post(overloaded));
    let addr = spawn_backend(router).await;

    let request = CompletionRequest::new("digest", &[], "hello");
    let err = complete_blocking(llm_config(addr, None), request)
        .await
        .expect_err("503 should fail");

    match err {
        AssistantError::ExternalService(message) => assert!(message.contains("503")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conversation_over_http_keeps_context_of_successful_turns() {
    let backend = FakeBackend::default();
    let router = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(backend.clone());
    let addr = spawn_backend(router).await;
    let cfg = llm_config(addr, None);

    let conversation = tokio::task::spawn_blocking(move || {
        let service = HttpCompletionService::new(&cfg).expect("client should build");
        let mut conversation = Conversation::default();
        conversation
            .ask(&service, "digest", "first")
            .expect("first turn");
        conversation
            .ask(&service, "digest", "second")
            .expect("second turn");
        conversation
    })
    .await
    .expect("blocking task should not panic");

    assert_eq!(conversation.context().len(), 4);
    assert_eq!(conversation.version(), 2);
    let answers: Vec<&str> = conversation
        .transcript()
        .iter()
        .filter(|e| e.kind == EntryKind::Assistant)
        .map(|e| e.content.as_str())
        .collect();
    assert_eq!(answers, vec!["saw 2 messages", "saw 4 messages"]);
    assert!(backend.auth.lock().expect("auth lock")[0].is_none());
}

#[test]
fn unreachable_backend_leaves_error_entry_and_no_context() {
    let cfg = LlmConfig {
        base_url: "http://127.0.0.1:9/v1".to_string(),
        timeout_ms: 500,
        ..LlmConfig::default()
    };
    let service = HttpCompletionService::new(&cfg).expect("client should build");
    let sessions = SessionStore::new();

    let outcome = sessions.with_conversation("s-1", |c| c.ask(&service, "digest", "hello?"));
    assert!(matches!(outcome, Err(AssistantError::ExternalService(_))));

    let snapshot = sessions.snapshot("s-1");
    let kinds: Vec<EntryKind> = snapshot.transcript().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EntryKind::User, EntryKind::Error]);
    assert!(snapshot.context().is_empty());
    assert!(snapshot.pending().is_none());

    let cleared = sessions.clear("s-1");
    assert!(cleared.transcript().is_empty());
    assert!(cleared.version() > snapshot.version());
    assert_eq!(sessions.len(), 1);
}
