use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::{json, Value};

use parley_ai::{CompletionError, CompletionReply, CompletionRequest, CompletionService};
use parley_api::app::{build_app, services::AppServices};
use parley_auth::{Hs256JwtValidator, JwtClaims, Role};
use parley_core::UserId;
use parley_infra::{Components, Settings};

const JWT_SECRET: &str = "test-secret";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

fn test_settings() -> Settings {
    Settings::from_lookup(|name| {
        let v = match name {
            "JWT_SECRET" => JWT_SECRET,
            "USE_PERSISTENT_STORES" => "false",
            "EMBEDDED_WORKERS" => "true",
            "WORKER_CONCURRENCY" => "2",
            "TASK_BACKOFF_BASE_MS" => "1",
            "TASK_BACKOFF_MAX_MS" => "5",
            _ => return None,
        };
        Some(v.to_string())
    })
    .expect("test settings")
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(None).await
    }

    /// Build app (same router as prod), but bind to an ephemeral port.
    async fn spawn_with(completion: Option<Arc<dyn CompletionService>>) -> Self {
        let settings = test_settings();
        let mut components = Components::from_settings(&settings).await.expect("components");
        if let Some(c) = completion {
            components.completion = c;
        }

        let services = Arc::new(AppServices::new(components, &settings));
        let jwt = Arc::new(Hs256JwtValidator::new(JWT_SECRET.as_bytes()));
        let app = build_app(services.clone(), jwt);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            services,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt_with(secret: &str, user: UserId, expires_in: ChronoDuration) -> String {
    let claims = JwtClaims::new(user, Role::USER, Utc::now() + expires_in);
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn mint_jwt(user: UserId) -> String {
    mint_jwt_with(JWT_SECRET, user, ChronoDuration::minutes(10))
}

async fn submit(client: &reqwest::Client, srv: &TestServer, token: &str, message: &str) -> String {
    let res = client
        .post(format!("{}/sessions", srv.base_url))
        .bearer_auth(token)
        .json(&json!({ "message": message }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "queued");
    assert!(body["task_id"].is_string());
    body["session_id"].as_str().unwrap().to_string()
}

/// Poll until the session reaches a terminal status (processing is asynchronous).
async fn wait_terminal(client: &reqwest::Client, srv: &TestServer, token: &str, id: &str) -> Value {
    for _ in 0..200 {
        let res = client
            .get(format!("{}/sessions/{}", srv.base_url, id))
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: Value = res.json().await.unwrap();
        if body["status"] == "completed" || body["status"] == "failed" {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("session {id} did not reach a terminal status within timeout");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn auth_required_for_session_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let user = UserId::new();

    let missing = client.get(format!("{}/sessions", srv.base_url)).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong_secret = mint_jwt_with("other-secret", user, ChronoDuration::minutes(10));
    let res = client
        .get(format!("{}/sessions", srv.base_url))
        .bearer_auth(wrong_secret)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let expired = mint_jwt_with(JWT_SECRET, user, ChronoDuration::minutes(-5));
    let res = client
        .post(format!("{}/sessions", srv.base_url))
        .bearer_auth(expired)
        .json(&json!({ "message": "Hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submitted_session_completes_with_one_reply() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(UserId::new());

    let id = submit(&client, &srv, &token, "Hello").await;
    let body = wait_terminal(&client, &srv, &token, &id).await;

    assert_eq!(body["status"], "completed");
    assert_eq!(body["session_id"], id.as_str());
    assert_eq!(
        body["messages"],
        json!([
            { "role": "user", "content": "Hello" },
            { "role": "assistant", "content": "echo: Hello" },
        ])
    );
    assert_eq!(body["meta"]["model_used"], "echo");
    assert!(body.get("error").is_none());

    let stats = srv.services.worker_stats().expect("embedded workers");
    assert!(stats.completed >= 1);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(UserId::new());

    let res = client
        .post(format!("{}/sessions", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "message": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    let res = client
        .post(format!("{}/sessions", srv.base_url))
        .bearer_auth(&token)
        .json(&json!({ "text": "wrong field" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let owner = mint_jwt(UserId::new());
    let stranger = mint_jwt(UserId::new());

    let id = submit(&client, &srv, &owner, "Hello").await;

    let res = client
        .get(format!("{}/sessions/{}", srv.base_url, id))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .get(format!("{}/sessions/not-a-session-id", srv.base_url))
        .bearer_auth(&owner)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let listed: Value = client
        .get(format!("{}/sessions", srv.base_url))
        .bearer_auth(&stranger)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["sessions"], json!([]));
}

#[tokio::test]
async fn listing_returns_callers_sessions_newest_first() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let token = mint_jwt(UserId::new());

    let first = submit(&client, &srv, &token, "first").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = submit(&client, &srv, &token, "second").await;

    let listed: Value = client
        .get(format!("{}/sessions", srv.base_url))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let ids: Vec<&str> = listed["sessions"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["session_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);
}

struct AlwaysDown;

#[async_trait]
impl CompletionService for AlwaysDown {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionReply, CompletionError> {
        Err(CompletionError::transient("provider returned 503"))
    }
}

#[tokio::test]
async fn exhausted_retries_surface_as_failed_with_error() {
    let srv = TestServer::spawn_with(Some(Arc::new(AlwaysDown))).await;
    let client = reqwest::Client::new();
    let token = mint_jwt(UserId::new());

    let id = submit(&client, &srv, &token, "Hello").await;
    let body = wait_terminal(&client, &srv, &token, &id).await;

    assert_eq!(body["status"], "failed");
    assert!(body["error"].as_str().unwrap().contains("503"));
    assert_eq!(body["messages"].as_array().unwrap().len(), 1);
}
