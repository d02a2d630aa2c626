//! HTTP API tests through the full Axum router (`oneshot`), backed by
//! in-memory stores and scripted model backends. No database or network.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use parley_core::chain::ChainBuilder;
use parley_core::config::SessionConfig;
use parley_core::embeddings::{EmbeddingBackend, EmbeddingError};
use parley_core::index::MemoryVectorIndex;
use parley_core::llm::{CompletionBackend, LlmError, PromptMessage, TokenStream};
use parley_core::prompts::FALLBACK_ANSWER;
use parley_core::retriever::KnowledgeBase;
use parley_core::store::{
    HistoryStore, InMemoryDocumentStore, InMemoryHistoryStore, InMemoryPromptStore,
};
use parley_ingest::{Indexer, RecursiveSplitter, Uploader};
use parley_server::http::{build_router, HttpState};
use parley_server::subsystems::session::SessionManager;
use serde_json::json;
use tower::ServiceExt;

const BOUNDARY: &str = "parley-test-boundary";

struct UnitEmbedder;

#[async_trait]
impl EmbeddingBackend for UnitEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(vec![1.0, 0.0])
    }
    fn dimensions(&self) -> usize {
        2
    }
    fn name(&self) -> &str {
        "unit"
    }
}

/// Streams `reply` word by word, or fails to open when `reply` is `None`.
struct ScriptedLlm {
    reply: Option<String>,
    systems: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    fn new(reply: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.map(str::to_string),
            systems: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CompletionBackend for ScriptedLlm {
    async fn complete(&self, messages: &[PromptMessage]) -> Result<String, LlmError> {
        self.systems.lock().unwrap().push(messages[0].content.clone());
        self.reply.clone().ok_or(LlmError::Api {
            code: 503,
            message: "overloaded".to_string(),
        })
    }

    async fn stream(&self, messages: &[PromptMessage]) -> Result<TokenStream, LlmError> {
        self.systems.lock().unwrap().push(messages[0].content.clone());
        let reply = self.reply.clone().ok_or(LlmError::Api {
            code: 503,
            message: "overloaded".to_string(),
        })?;
        let tokens: Vec<Result<String, LlmError>> =
            reply.split_inclusive(' ').map(|t| Ok(t.to_string())).collect();
        Ok(Box::pin(futures::stream::iter(tokens)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

struct TestApp {
    state: Arc<HttpState>,
    documents: Arc<InMemoryDocumentStore>,
    answer: Arc<ScriptedLlm>,
}

fn make_app(reply: Option<&str>) -> TestApp {
    let history = Arc::new(InMemoryHistoryStore::new());
    let documents = Arc::new(InMemoryDocumentStore::new());
    let prompts = Arc::new(InMemoryPromptStore::new());
    let index = Arc::new(MemoryVectorIndex::new());
    let embedder = Arc::new(UnitEmbedder);

    let answer = ScriptedLlm::new(reply);
    let builder = ChainBuilder::new(ScriptedLlm::new(Some("standalone")), answer.clone());
    let knowledge = KnowledgeBase::new(index.clone(), embedder.clone(), "documents", 3);
    let sessions = Arc::new(SessionManager::new(
        history.clone(),
        prompts.clone(),
        builder,
        knowledge,
        &SessionConfig::default(),
    ));

    let indexer = Arc::new(Indexer::new(
        documents.clone(),
        index,
        embedder,
        RecursiveSplitter::new(200, 20).unwrap(),
        chrono::Duration::minutes(10),
    ));

    let state = Arc::new(HttpState {
        pool: None,
        sessions,
        uploader: Arc::new(Uploader::new(documents.clone(), 64 * 1024)),
        indexer,
        documents: documents.clone(),
        history,
        prompts,
        index_name: "documents".to_string(),
        default_batch_size: 10,
    });

    TestApp {
        state,
        documents,
        answer,
    }
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn upload_request(file_name: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            file_name
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/bot/import_data")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &TestApp, req: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
    let resp = build_router(app.state.clone()).oneshot(req).await.unwrap();
    let status = resp.status();
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec();
    (status, content_type, bytes)
}

async fn send_json(app: &TestApp, req: Request<Body>) -> (StatusCode, serde_json::Value) {
    let (status, _, bytes) = send(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

// ===========================================================================
// TEST 1: GET /version and /health without a database
// ===========================================================================
#[tokio::test]
async fn test_version_and_health() {
    let app = make_app(Some("unused"));

    let req = Request::builder().uri("/version").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["pending_documents"], 0);
}

// ===========================================================================
// TEST 2: stream_chat with no knowledge base streams the fallback text
// ===========================================================================
#[tokio::test]
async fn test_stream_chat_fallback_without_index() {
    let app = make_app(Some("unused"));
    let req = json_request(
        "POST",
        "/api/bot/stream_chat",
        json!({"conversation_id": "c1", "message": "Anything?"}),
    );

    let (status, content_type, bytes) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("text/plain; charset=utf-8"));
    assert_eq!(String::from_utf8(bytes).unwrap(), FALLBACK_ANSWER);

    let req = Request::builder()
        .uri("/api/bot/conversations/c1/history")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let turns = body["data"]["turns"].as_array().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0]["role"], "user");
    assert_eq!(turns[1]["text"], FALLBACK_ANSWER);
}

// ===========================================================================
// TEST 3: empty conversation id is a JSON 400, not a stream
// ===========================================================================
#[tokio::test]
async fn test_stream_chat_rejects_empty_conversation_id() {
    let app = make_app(Some("unused"));
    let req = json_request(
        "POST",
        "/api/bot/stream_chat",
        json!({"conversation_id": "  ", "message": "hi"}),
    );

    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(body["error"].as_str().unwrap().contains("conversation_id"));
}

// ===========================================================================
// TEST 4: upload → batch index → grounded chat answer
// ===========================================================================
#[tokio::test]
async fn test_upload_index_then_chat() {
    let app = make_app(Some("Roses need six hours of sun."));

    let (status, body) = send_json(&app, upload_request("roses.txt", b"Roses need sun.")).await;
    assert_eq!(status, StatusCode::OK, "upload failed: {}", body);
    let doc_id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(app.documents.len(), 1);

    let req = Request::builder()
        .method("POST")
        .uri("/api/bot/process_unprocessed")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["indexed_ids"][0], doc_id.as_str());
    assert_eq!(body["data"]["failed"].as_array().unwrap().len(), 0);

    let req = Request::builder()
        .uri(format!("/api/bot/documents/{}", doc_id))
        .body(Body::empty())
        .unwrap();
    let (_, body) = send_json(&app, req).await;
    assert_eq!(body["data"]["is_processed"], true);

    let req = json_request(
        "POST",
        "/api/bot/chat",
        json!({"conversation_id": "garden", "message": "Do roses like sun?"}),
    );
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["answer"], "Roses need six hours of sun.");

    let systems = app.answer.systems.lock().unwrap().clone();
    assert!(systems[0].contains("Roses need sun."));
}

// ===========================================================================
// TEST 5: unsupported upload type is rejected without a record
// ===========================================================================
#[tokio::test]
async fn test_upload_exe_rejected() {
    let app = make_app(Some("unused"));
    let (status, body) = send_json(&app, upload_request("setup.exe", b"MZ")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(app.documents.is_empty());
}

// ===========================================================================
// TEST 6: invalid index name in the batch trigger is a 400
// ===========================================================================
#[tokio::test]
async fn test_process_unprocessed_bad_index_name() {
    let app = make_app(Some("unused"));
    let req = json_request(
        "POST",
        "/api/bot/process_unprocessed",
        json!({"index_name": "Bad Name!"}),
    );

    let (status, _) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ===========================================================================
// TEST 7: custom prompt update is visible and used on the next turn
// ===========================================================================
#[tokio::test]
async fn test_custom_prompt_update_applies_next_turn() {
    let app = make_app(Some("ok"));
    send_json(&app, upload_request("faq.txt", b"Opening hours are 9 to 5.")).await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/bot/process_unprocessed")
        .body(Body::empty())
        .unwrap();
    send_json(&app, req).await;

    let req = json_request(
        "POST",
        "/api/bot/custom_prompt",
        json!({"prompt": "Answer as a pirate. {context}"}),
    );
    let (status, _) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .uri("/api/bot/custom_prompt")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send_json(&app, req).await;
    assert_eq!(body["data"]["content"], "Answer as a pirate. {context}");

    let req = json_request(
        "POST",
        "/api/bot/chat",
        json!({"conversation_id": "c", "message": "When are you open?"}),
    );
    send_json(&app, req).await;

    let systems = app.answer.systems.lock().unwrap().clone();
    assert!(systems[0].starts_with("Answer as a pirate."));

    let req = Request::builder()
        .uri("/api/bot/custom_prompt/revisions?limit=5")
        .body(Body::empty())
        .unwrap();
    let (_, body) = send_json(&app, req).await;
    assert_eq!(body["data"]["revisions"].as_array().unwrap().len(), 1);
}

// ===========================================================================
// TEST 8: generation failure before the first fragment is a JSON 502
// ===========================================================================
#[tokio::test]
async fn test_stream_chat_generation_failure_is_json_error() {
    let app = make_app(None);
    send_json(&app, upload_request("a.txt", b"Some text.")).await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/bot/process_unprocessed")
        .body(Body::empty())
        .unwrap();
    send_json(&app, req).await;

    let req = json_request(
        "POST",
        "/api/bot/stream_chat",
        json!({"conversation_id": "c", "message": "hi"}),
    );
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "Upstream service error");

    // The user turn is kept, no assistant turn was written.
    let turns = app.state.history.load_window("c", 10).await.unwrap();
    assert_eq!(turns.len(), 1);
}

// ===========================================================================
// TEST 9: missing message field is a 400
// ===========================================================================
#[tokio::test]
async fn test_chat_requires_message() {
    let app = make_app(Some("unused"));
    let req = json_request("POST", "/api/bot/chat", json!({"conversation_id": "c"}));
    let (status, body) = send_json(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("message"));
}
