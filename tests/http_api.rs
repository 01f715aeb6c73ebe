//! HTTP surface behavior driven in-process through the router.

use agentcom::http_api::create_app;
use agentcom::{Hub, HubConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use std::sync::Arc;
use tower::ServiceExt;

async fn test_hub() -> (Arc<Hub>, axum::Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = HubConfig {
        data_dir: dir.path().join("data"),
        backup_dir: dir.path().join("backups"),
        ..HubConfig::default()
    };
    let hub = Hub::open(config).await.unwrap();
    let app = create_app(hub.clone());
    (hub, app, dir)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_reports_service_and_connection_count() {
    let (_hub, app, _dir) = test_hub().await;
    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "agentcom");
    assert_eq!(body["agents_connected"], 0);
}

#[tokio::test]
async fn unknown_routes_are_404() {
    let (_hub, app, _dir) = test_hub().await;
    let response = app
        .oneshot(Request::get("/api/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let (_hub, app, _dir) = test_hub().await;
    for path in ["/api/agents", "/api/mailbox/x", "/api/channels", "/api/goals"] {
        let response = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
}

#[tokio::test]
async fn token_admin_cycle() {
    let (_hub, app, _dir) = test_hub().await;

    let response = app
        .clone()
        .oneshot(
            Request::post("/admin/tokens")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"agent_id":"worker-1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    let token = created["token"].as_str().unwrap().to_string();
    assert_eq!(created["agent_id"], "worker-1");
    assert_eq!(token.len(), 64);

    // The listing shows a truncated prefix, never the raw token.
    let response = app
        .clone()
        .oneshot(Request::get("/admin/tokens").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listed = body_json(response).await;
    let entries = listed.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    let prefix = entries[0]["token_prefix"].as_str().unwrap();
    assert!(prefix.len() < token.len());
    assert!(token.starts_with(&prefix[..8]));

    // The minted token authenticates.
    let response = app
        .clone()
        .oneshot(
            Request::get("/api/agents")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Revocation removes it.
    let response = app
        .clone()
        .oneshot(
            Request::delete("/admin/tokens/worker-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["revoked"], 1);

    let response = app
        .oneshot(
            Request::get("/api/agents")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn message_requires_payload_field() {
    let (hub, app, _dir) = test_hub().await;
    let token = hub
        .auth
        .generate(agentcom::domain_types::AgentId::try_new("a").unwrap())
        .await
        .unwrap();
    let response = app
        .oneshot(
            Request::post("/api/message")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"to":"b"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn goal_and_task_submission_flow() {
    let (hub, app, _dir) = test_hub().await;
    let token = hub
        .auth
        .generate(agentcom::domain_types::AgentId::try_new("ops").unwrap())
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/goals")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"description":"ship the feature","priority":1}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let goal = body_json(response).await;
    assert_eq!(goal["status"], "submitted");
    let goal_id = goal["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/tasks")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(format!(
                    r#"{{"description":"fix typo in readme","goal_id":"{goal_id}"}}"#
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let task = body_json(response).await;
    assert_eq!(task["status"], "queued");
    assert_eq!(task["complexity"]["effective_tier"], "trivial");

    // The goal now references its child task.
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/goals/{goal_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let goal = body_json(response).await;
    assert_eq!(goal["child_task_ids"].as_array().unwrap().len(), 1);

    // Listing filters by status.
    let response = app
        .oneshot(
            Request::get("/api/tasks?status=queued")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let tasks = body_json(response).await;
    assert_eq!(tasks.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_http_message_gets_429_with_retry_after() {
    let (hub, app, _dir) = test_hub().await;
    let agent = agentcom::domain_types::AgentId::try_new("chatty").unwrap();
    let token = hub.auth.generate(agent.clone()).await.unwrap();
    hub.limiter.set_override(
        agent,
        agentcom::rate_limit::RateLimits {
            normal: agentcom::rate_limit::TierLimit {
                capacity: 1,
                refill_per_sec: 0.1,
            },
            ..agentcom::rate_limit::RateLimits::default()
        },
    );

    let send = |app: axum::Router| {
        let token = token.clone();
        async move {
            app.oneshot(
                Request::post("/api/message")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"payload":{"text":"hi"}}"#))
                    .unwrap(),
            )
            .await
            .unwrap()
        }
    };

    let first = send(app.clone()).await;
    assert_eq!(first.status(), StatusCode::OK);

    let second = send(app).await;
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key(header::RETRY_AFTER));
    let body = body_json(second).await;
    assert_eq!(body["error"], "rate_limited");
    assert!(body["retry_after_ms"].as_u64().unwrap() >= 1000);
}
