//! HTTP API tests: router via `oneshot`, plus one test over a real socket.

mod common;

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use lora_hotswap::config::{Config, PersonaConfig};
use lora_hotswap::server::{build_router, AppState};

use common::{engine, write_lora};

fn app(dir: &Path, config: Config) -> Router {
    build_router(Arc::new(AppState::new(engine(dir, config))))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call_raw(app, method, uri, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn call_raw(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(v) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(v.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn test_adapter_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    let poet = write_lora(dir.path(), "poet.gguf", "llama", 1);

    let (status, info) = call(
        &app,
        Method::POST,
        "/v1/adapters",
        Some(json!({"path": pirate, "scale": 0.5})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(info["name"], "pirate");
    assert_eq!(info["scale"], 0.5);

    let (status, info) = call(
        &app,
        Method::PATCH,
        "/v1/adapters/pirate",
        Some(json!({"scale": 1.5})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["scale"], 1.5);

    let (status, info) = call(
        &app,
        Method::POST,
        "/v1/adapters/pirate/swap",
        Some(json!({"target": poet})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["name"], "poet");
    assert_eq!(info["scale"], 1.5);

    let (status, snapshot) = call(&app, Method::GET, "/v1/adapters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(snapshot["active"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["active"][0]["name"], "poet");
    assert_eq!(snapshot["stats"]["parsed"], 2);

    let (status, _) = call(&app, Method::DELETE, "/v1/adapters/poet", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, Method::POST, "/v1/adapter-cache/prune", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pruned"], 2);
}

#[tokio::test]
async fn test_error_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());
    let mistral = write_lora(dir.path(), "mistral.gguf", "mistral", 1);

    let (status, body) = call(
        &app,
        Method::POST,
        "/v1/adapters",
        Some(json!({"path": dir.path().join("missing.gguf")})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "file_not_found");

    let (status, body) = call(
        &app,
        Method::POST,
        "/v1/adapters",
        Some(json!({"path": mistral})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "adapter_load_failed");

    let (status, body) = call(
        &app,
        Method::PATCH,
        "/v1/adapters/ghost",
        Some(json!({"scale": 1.0})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "adapter_not_found");

    let (status, _) = call(&app, Method::POST, "/v1/personas/ghost/activate", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_handle_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);

    let (status, _) = call(&app, Method::POST, "/v1/adapters", Some(json!({"path": pirate}))).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(
        &app,
        Method::POST,
        "/v1/adapters",
        Some(json!({"path": pirate, "name": "pirate-2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "adapter_already_active");
}

#[tokio::test]
async fn test_chat_completion_reports_adapters() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    call(&app, Method::POST, "/v1/adapters", Some(json!({"path": pirate}))).await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/v1/chat/completions",
        Some(json!({
            "messages": [{"role": "user", "content": "Ahoy"}],
            "max_tokens": 6
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "length");
    assert_eq!(body["usage"]["completion_tokens"], 6);
    assert_eq!(body["adapters"], json!(["pirate"]));
}

#[tokio::test]
async fn test_chat_rejects_empty_messages() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());

    let (status, body) = call(
        &app,
        Method::POST,
        "/v1/chat/completions",
        Some(json!({"messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_streaming_completion() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());

    let (status, bytes) = call_raw(
        &app,
        Method::POST,
        "/v1/completions",
        Some(json!({"prompt": "Once upon", "max_tokens": 3, "stream": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8(bytes).unwrap();
    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    // Three tokens, the finish chunk, then the sentinel.
    assert_eq!(events.len(), 5);
    assert_eq!(events.last(), Some(&"[DONE]"));
    let finish: Value = serde_json::from_str(events[3]).unwrap();
    assert_eq!(finish["choices"][0]["finish_reason"], "length");
}

#[tokio::test]
async fn test_persona_activation() {
    let dir = tempfile::tempdir().unwrap();
    let poet = write_lora(dir.path(), "poet-v2.gguf", "llama", 1);
    let mut config = Config::default();
    config.personas.push(PersonaConfig {
        name: "poet".to_string(),
        adapter: poet,
        scale: 0.6,
        system_prompt: Some("Answer in verse.".to_string()),
    });
    let app = app(dir.path(), config);

    let (_, personas) = call(&app, Method::GET, "/v1/personas", None).await;
    assert_eq!(personas[0]["name"], "poet");
    assert_eq!(personas[0]["active"], false);

    let (status, info) = call(&app, Method::POST, "/v1/personas/poet/activate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["name"], "poet");
    assert_eq!(info["scale"], 0.6);

    let (_, personas) = call(&app, Method::GET, "/v1/personas", None).await;
    assert_eq!(personas[0]["active"], true);

    let (_, cleared) = call(&app, Method::DELETE, "/v1/adapters", None).await;
    assert_eq!(cleared["cleared"], 1);
    let (_, personas) = call(&app, Method::GET, "/v1/personas", None).await;
    assert_eq!(personas[0]["active"], false);
}

#[tokio::test]
async fn test_health_models_and_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());
    let pirate = write_lora(dir.path(), "pirate.gguf", "llama", 1);
    call(&app, Method::POST, "/v1/adapters", Some(json!({"path": pirate}))).await;

    let (status, health) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["model"]["architecture"], "llama");
    assert_eq!(health["adapters"]["active"][0]["name"], "pirate");

    let (_, models) = call(&app, Method::GET, "/v1/models", None).await;
    assert_eq!(models["data"][0]["id"], "base");

    let (status, bytes) = call_raw(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(bytes).unwrap();
    assert!(text.contains("lora_hotswap_adapter_operations_total"));
}

#[tokio::test]
async fn test_live_server_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(dir.path(), Config::default());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["adapters"]["stats"]["active"], 0);
}
