use super::*;
use crate::retry::{FailureClass, TOKEN_INVALID_DESCRIPTION, classify};
use crate::types::{Token, UserHandle};
use serde_json::json;
use std::time::Duration;
use tempfile::NamedTempFile;
use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn create_test_client(server: &MockServer) -> (ApiClient, Arc<Database>, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(temp_file.path()).await.unwrap());
    db.set_token(&Token {
        access_token: "a1".into(),
        refresh_token: Some("r1".into()),
        scope: "block.write mute.write".into(),
        self_user: Some(UserHandle::new("42", "me")),
    })
    .await
    .unwrap();

    let mut config = Config::default();
    config.api.base_url = server.uri();
    config.api.client_id = "client-1".into();
    let client = ApiClient::new(&config, db.clone()).unwrap();

    (client, db, temp_file)
}

#[tokio::test]
async fn test_self_id_substitution_params_and_bearer() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/users/42/blocking"))
        .and(query_param("max_results", "1000"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client
        .request(&Request::get("/2/users/:id/blocking").param("max_results", 1000))
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({"data": []}));
}

#[tokio::test]
async fn test_post_sends_json_body() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("POST"))
        .and(path("/2/users/42/muting"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"target_user_id": "7"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"muting": true}})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client
        .post("/2/users/:id/muting", json!({"target_user_id": "7"}))
        .await
        .unwrap();
    assert_eq!(response.body["data"]["muting"], true);
}

#[tokio::test]
async fn test_absolute_url_is_sent_to_base_host() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/tweets/5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "5"}})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.get("https://api.twitter.com/2/tweets/5").await.unwrap();
    assert_eq!(response.body["data"]["id"], "5");
}

#[tokio::test]
async fn test_missing_identity_or_token_is_auth_error() {
    let server = MockServer::start().await;
    let (client, db, _file) = create_test_client(&server).await;

    db.set_token(&Token {
        access_token: "a1".into(),
        ..Default::default()
    })
    .await
    .unwrap();
    let err = client.get("/2/users/:id/following").await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "got {:?}", err);

    db.kv_remove(&[crate::db::CREDENTIALS_KEY]).await.unwrap();
    let err = client.get("/2/tweets/1").await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_error_response_carries_status_headers_and_body() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/tweets/1/liking_users"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-rate-limit-reset", "1700000000")
                .set_body_json(json!({"title": "Too Many Requests"})),
        )
        .mount(&server)
        .await;

    let err = client.get("/2/tweets/1/liking_users").await.unwrap_err();
    let failure = err.response().unwrap();
    assert_eq!(failure.status, 429);
    assert_eq!(failure.header("X-Rate-Limit-Reset"), Some("1700000000"));
    assert_eq!(failure.body["title"], "Too Many Requests");
    assert_eq!(classify(&err), FailureClass::RateLimited);
}

#[tokio::test]
async fn test_cache_hit_skips_network() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/users/by/username/someone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "9"}})))
        .expect(1)
        .mount(&server)
        .await;

    let request = Request::get("/2/users/by/username/someone").cached();
    let first = client.request(&request).await.unwrap();
    let second = client.request(&request).await.unwrap();

    assert_eq!(first.body, second.body);
    assert_eq!(second.status, 200);
}

#[tokio::test]
async fn test_unauthorized_refreshes_once_and_retries() {
    let server = MockServer::start().await;
    let (client, db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/tweets/1"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/oauth2/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("client_id=client-1"))
        .and(body_string_contains("refresh_token=r1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "a2", "refresh_token": "r2"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/2/tweets/1"))
        .and(header("authorization", "Bearer a2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"id": "1"}})))
        .expect(1)
        .mount(&server)
        .await;

    let response = client.get("/2/tweets/1").await.unwrap();
    assert_eq!(response.body["data"]["id"], "1");

    let token = db.token().await.unwrap().unwrap();
    assert_eq!(token.access_token, "a2");
    assert_eq!(token.refresh_token.as_deref(), Some("r2"));
    // Identity survives the merge
    assert_eq!(token.self_user, Some(UserHandle::new("42", "me")));
}

#[tokio::test]
async fn test_unauthorized_after_refresh_is_hard_failure() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    Mock::given(method("GET"))
        .and(path("/2/tweets/1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "a2"})))
        .expect(1)
        .mount(&server)
        .await;

    let err = client.get("/2/tweets/1").await.unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_refresh_failure_propagates() {
    let server = MockServer::start().await;
    let (client, db, _file) = create_test_client(&server).await;

    Mock::given(method("POST"))
        .and(path("/2/users/42/blocking"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/oauth2/token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"error": "invalid_request", "error_description": TOKEN_INVALID_DESCRIPTION})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let err = client
        .post("/2/users/:id/blocking", json!({"target_user_id": "7"}))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(400));
    assert_eq!(classify(&err), FailureClass::TokenDesync);
    assert_eq!(db.access_token().await.unwrap().as_deref(), Some("a1"));
}

#[tokio::test]
async fn test_concurrent_unauthorized_calls_refresh_once() {
    let server = MockServer::start().await;
    let (client, _db, _file) = create_test_client(&server).await;

    // Both calls see the stale token; the second 401 arrives after the first
    // caller has already refreshed.
    Mock::given(method("GET"))
        .and(path("/2/a"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(10)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/2/b"))
        .and(header("authorization", "Bearer a1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/oauth2/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"access_token": "a3", "refresh_token": "r3"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    for endpoint in ["/2/a", "/2/b"] {
        Mock::given(method("GET"))
            .and(path(endpoint))
            .and(header("authorization", "Bearer a3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": endpoint})))
            .expect(1)
            .mount(&server)
            .await;
    }

    let (a, b) = tokio::join!(client.get("/2/a"), client.get("/2/b"));
    assert_eq!(a.unwrap().body["ok"], "/2/a");
    assert_eq!(b.unwrap().body["ok"], "/2/b");
}
