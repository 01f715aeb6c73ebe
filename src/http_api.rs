//! HTTP surface
//!
//! JSON over HTTP for everything a disconnected client needs: health,
//! presence listing, message submission, mailbox polling, token and repo
//! administration, goal/task submission, and the WebSocket upgrade.
//! Authentication is a bearer token (header or `?token=` query parameter).

use crate::domain_types::{AgentId, GoalId, MessageId, TaskId};
use crate::error::slug;
use crate::goals::{GoalFilter, SubmitGoal};
use crate::hub::Hub;
use crate::message::{Message, MessageKind};
use crate::rate_limit::{LimitChannel, LimitDecision, LimitTier};
use crate::repos::RepoEntry;
use crate::router::RouterError;
use crate::session;
use crate::tasks::{SubmitTask, TaskStatus};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

type AppState = Arc<Hub>;

/// Error body shared by every failing response.
#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, slug: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: slug.to_string(),
        }),
    )
        .into_response()
}

/// Builds the full application router.
pub fn create_app(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", get(list_agents))
        .route("/api/message", post(post_message))
        .route("/api/mailbox/{agent_id}", get(poll_mailbox))
        .route("/api/mailbox/{agent_id}/ack", post(ack_mailbox))
        .route("/api/channels", get(list_channels))
        .route("/api/goals", get(list_goals).post(submit_goal))
        .route("/api/goals/{goal_id}", get(get_goal))
        .route("/api/tasks", get(list_tasks).post(submit_task))
        .route("/api/tasks/{task_id}", get(get_task))
        .route("/admin/tokens", get(list_tokens).post(create_token))
        .route("/admin/tokens/{agent_id}", delete(revoke_tokens))
        .route("/admin/repos", get(list_repos).post(register_repo))
        .route("/ws", get(ws_upgrade))
        .fallback(not_found)
        .with_state(hub)
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, slug::NOT_FOUND)
}

/// Resolves the caller from `Authorization: Bearer <token>` or `?token=`.
async fn authenticate(
    hub: &Hub,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<AgentId, Response> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let token = bearer.or_else(|| query.get("token").cloned());
    let Some(token) = token else {
        return Err(error_response(StatusCode::UNAUTHORIZED, slug::UNAUTHORIZED));
    };
    hub.auth
        .verify(&token)
        .await
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, slug::UNAUTHORIZED))
}

fn internal_error(err: &dyn std::fmt::Display) -> Response {
    warn!(error = %err, "http request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
}

async fn health(State(hub): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "agentcom",
        "agents_connected": hub.presence.count(),
    }))
}

async fn list_agents(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match authenticate(&hub, &headers, &query).await {
        Ok(_) => Json(hub.presence.list()).into_response(),
        Err(rejection) => rejection,
    }
}

#[derive(Debug, Deserialize)]
struct SendMessageBody {
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    kind: Option<MessageKind>,
    payload: Option<serde_json::Value>,
    #[serde(default)]
    reply_to: Option<String>,
    /// Queue to the recipient's mailbox when they are offline.
    #[serde(default)]
    mailbox: bool,
}

async fn post_message(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    let from = match authenticate(&hub, &headers, &query).await {
        Ok(agent) => agent,
        Err(rejection) => return rejection,
    };
    let Some(payload) = body.payload else {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    };
    match hub.limiter.check(&from, LimitChannel::Http, LimitTier::Normal) {
        LimitDecision::Deny { .. } => {
            let retry_ms = hub.limiter.record_violation(&from);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, (retry_ms / 1000).max(1).to_string())],
                Json(json!({ "error": slug::RATE_LIMITED, "retry_after_ms": retry_ms })),
            )
                .into_response();
        }
        LimitDecision::Allow { .. } | LimitDecision::Warn { .. } | LimitDecision::Exempt => {}
    }

    let message = Message::build(
        from,
        body.to,
        body.kind.unwrap_or_default(),
        payload,
        body.reply_to.map(MessageId::new),
    );
    match hub.router.route(&message).await {
        Ok(outcome) => Json(json!({
            "id": message.id,
            "result": outcome.as_str(),
        }))
        .into_response(),
        Err(RouterError::AgentOffline(recipient)) if body.mailbox => {
            match hub.mailbox.enqueue(&recipient, message.clone()).await {
                Ok(seq) => Json(json!({
                    "id": message.id,
                    "result": "queued",
                    "seq": seq,
                }))
                .into_response(),
                Err(err) => internal_error(&err),
            }
        }
        Err(RouterError::AgentOffline(_) | RouterError::InvalidRecipient) => {
            error_response(StatusCode::UNPROCESSABLE_ENTITY, slug::AGENT_OFFLINE)
        }
        Err(RouterError::Store(err)) if err.is_corruption() => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, slug::TABLE_CORRUPTED)
        }
        Err(RouterError::Store(err)) => internal_error(&err),
    }
}

async fn poll_mailbox(
    State(hub): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let caller = match authenticate(&hub, &headers, &query).await {
        Ok(agent) => agent,
        Err(rejection) => return rejection,
    };
    if caller.as_str() != agent_id {
        return error_response(StatusCode::UNAUTHORIZED, slug::UNAUTHORIZED);
    }
    let since = query
        .get("since")
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(0);
    match hub.mailbox.poll(&caller, since).await {
        Ok(batch) => Json(batch).into_response(),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct AckBody {
    seq: u64,
}

async fn ack_mailbox(
    State(hub): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<AckBody>,
) -> Response {
    let caller = match authenticate(&hub, &headers, &query).await {
        Ok(agent) => agent,
        Err(rejection) => return rejection,
    };
    if caller.as_str() != agent_id {
        return error_response(StatusCode::UNAUTHORIZED, slug::UNAUTHORIZED);
    }
    match hub.mailbox.ack(&caller, body.seq).await {
        Ok(acked) => Json(json!({ "acked": acked })).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn list_channels(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    match authenticate(&hub, &headers, &query).await {
        Ok(_) => match hub.channels.list().await {
            Ok(channels) => Json(channels).into_response(),
            Err(err) => internal_error(&err),
        },
        Err(rejection) => rejection,
    }
}

async fn submit_goal(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<SubmitGoal>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    if body.description.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    }
    if let Some(repo) = &body.repo {
        if let Err(err) = hub.repos.check_reference(repo).await {
            warn!(%err, "repo reference check failed");
        }
    }
    match hub.goals.submit(body).await {
        Ok(goal) => Json(goal).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn list_goals(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Query(filter): Query<GoalFilter>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    match hub.goals.list(&filter).await {
        Ok(goals) => Json(goals).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn get_goal(
    State(hub): State<AppState>,
    Path(goal_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    match hub.goals.get(&GoalId::new(goal_id)).await {
        Ok(Some(goal)) => Json(goal).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, slug::NOT_FOUND),
        Err(err) => internal_error(&err),
    }
}

async fn submit_task(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<SubmitTask>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    if body.description.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    }
    let goal_id = body.goal_id.clone();
    match hub.tasks.enqueue(body).await {
        Ok(task) => {
            if let Some(goal_id) = goal_id {
                if let Err(err) = hub.goals.attach_task(&goal_id, task.id.clone()).await {
                    warn!(%err, "failed to attach task to goal");
                }
            }
            Json(task).into_response()
        }
        Err(err) => internal_error(&err),
    }
}

async fn list_tasks(
    State(hub): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    let status = query
        .get("status")
        .and_then(|raw| serde_json::from_value::<TaskStatus>(json!(raw)).ok());
    match hub.tasks.list(status).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn get_task(
    State(hub): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if let Err(rejection) = authenticate(&hub, &headers, &query).await {
        return rejection;
    }
    match hub.tasks.get(&TaskId::new(task_id)).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, slug::NOT_FOUND),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Deserialize)]
struct CreateTokenBody {
    agent_id: String,
}

async fn create_token(
    State(hub): State<AppState>,
    Json(body): Json<CreateTokenBody>,
) -> Response {
    let Ok(agent_id) = AgentId::try_new(body.agent_id) else {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    };
    match hub.auth.generate(agent_id.clone()).await {
        Ok(token) => (
            StatusCode::CREATED,
            Json(json!({ "agent_id": agent_id, "token": token })),
        )
            .into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn list_tokens(State(hub): State<AppState>) -> Response {
    Json(hub.auth.list().await).into_response()
}

async fn revoke_tokens(State(hub): State<AppState>, Path(agent_id): Path<String>) -> Response {
    let Ok(agent_id) = AgentId::try_new(agent_id) else {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    };
    match hub.auth.revoke(&agent_id).await {
        Ok(revoked) => Json(json!({ "revoked": revoked })).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn register_repo(State(hub): State<AppState>, Json(body): Json<RepoEntry>) -> Response {
    if body.name.trim().is_empty() || body.path.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, slug::MISSING_FIELD);
    }
    match hub.repos.register(body).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn list_repos(State(hub): State<AppState>) -> Response {
    match hub.repos.list().await {
        Ok(repos) => Json(repos).into_response(),
        Err(err) => internal_error(&err),
    }
}

async fn ws_upgrade(State(hub): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::run(socket, hub))
        .into_response()
}
