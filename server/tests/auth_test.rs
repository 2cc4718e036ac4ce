//! Integration tests for the login flow: signup on first use, password
//! checks, token contents, and rate limiting.

use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use courier_server::auth::jwt::{load_or_generate_jwt_secret, validate_access_token, JwtVerifier};
use courier_server::chat::{ChatProtocolHandler, ChatSettings};
use courier_server::store::{ChatStore, SqliteStore};

/// Helper: start the server on a random port and return (base_url, jwt_secret).
async fn start_test_server() -> (String, Vec<u8>) {
    // Create a temporary data directory
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = courier_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = load_or_generate_jwt_secret(&data_dir).expect("Failed to generate JWT secret");

    let store: Arc<dyn ChatStore> = Arc::new(SqliteStore::new(db));
    let chat = Arc::new(ChatProtocolHandler::new(
        store.clone(),
        Arc::new(JwtVerifier::new(jwt_secret.clone())),
        ChatSettings::default(),
    ));
    let state = courier_server::state::AppState {
        chat,
        store,
        jwt_secret: Arc::new(jwt_secret.clone()),
    };

    let app = courier_server::routes::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        // Keep tmp_dir alive so the data directory isn't deleted
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), jwt_secret)
}

async fn post_login(base_url: &str, username: &str, password: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/auth/login", base_url))
        .json(&json!({ "username": username, "password": password }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_login_creates_account() {
    let (base_url, secret) = start_test_server().await;

    let resp = post_login(&base_url, "alice", "s3cret").await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();

    let user_id = body["user"]["id"].as_str().unwrap();
    assert_eq!(body["user"]["name"], "alice");
    assert_eq!(body["user"]["online"], false);
    assert!(body["user"].get("passwordHash").is_none());
    assert!(body["user"].get("password_hash").is_none());

    let claims = validate_access_token(&secret, body["token"].as_str().unwrap())
        .expect("Token should validate with the server secret");
    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.username, "alice");
    assert_eq!(claims.exp - claims.iat, 24 * 60 * 60);
}

#[tokio::test]
async fn test_repeat_login_returns_same_user() {
    let (base_url, _) = start_test_server().await;

    let first: Value = post_login(&base_url, "bob", "pw").await.json().await.unwrap();
    let second: Value = post_login(&base_url, "bob", "pw").await.json().await.unwrap();
    assert_eq!(first["user"]["id"], second["user"]["id"]);
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let (base_url, _) = start_test_server().await;

    assert_eq!(post_login(&base_url, "carol", "right").await.status(), 200);
    assert_eq!(post_login(&base_url, "carol", "wrong").await.status(), 401);
}

#[tokio::test]
async fn test_empty_credentials_are_bad_requests() {
    let (base_url, _) = start_test_server().await;

    assert_eq!(post_login(&base_url, "", "pw").await.status(), 400);
    assert_eq!(post_login(&base_url, "   ", "pw").await.status(), 400);
    assert_eq!(post_login(&base_url, "dave", "").await.status(), 400);
}

#[tokio::test]
async fn test_login_rate_limiting() {
    let (base_url, _) = start_test_server().await;

    // Burst of 10 is allowed, the next request from the same IP is throttled
    let mut statuses = Vec::new();
    for _ in 0..12 {
        statuses.push(post_login(&base_url, "", "").await.status().as_u16());
    }
    assert!(statuses[..10].iter().all(|s| *s == 400), "statuses: {:?}", statuses);
    assert_eq!(statuses[11], 429);
}

#[tokio::test]
async fn test_health_check() {
    let (base_url, _) = start_test_server().await;

    let resp = reqwest::get(format!("{}/health", base_url)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}
