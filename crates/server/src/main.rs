use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use server_api::{today, ApiContext};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{
        PresenceEntry, PresencePayload, ProfilePayload, PushSubscriptionPayload, ServerEvent,
        UpsertPresenceRequest,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod config;
mod push;

use config::{load_settings, prepare_database_url};
use push::PushDispatcher;

const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ServerEvent>,
    push: PushDispatcher,
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct DayQuery {
    day: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct UserDayQuery {
    user_id: i64,
    day: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext { storage };
    let (events, _) = broadcast::channel(256);
    let push = PushDispatcher::new(
        settings.push_enabled,
        Duration::from_secs(settings.push_timeout_secs),
    );

    let state = AppState { api, events, push };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/presences/today", get(http_today_roster))
        .route("/presences/me", get(http_my_presence))
        .route("/presences", post(http_upsert_presence))
        .route("/presences", delete(http_remove_presence))
        .route("/profiles/:user_id", get(http_get_profile))
        .route("/profiles", post(http_update_profile))
        .route("/push/subscriptions", post(http_subscribe_push))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ApiError>)> {
    let username = req.username.trim();
    if username.is_empty() {
        return Err(reject(ApiError::validation("username must not be empty")));
    }
    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    Ok(Json(LoginResponse { user_id: user_id.0 }))
}

async fn http_today_roster(
    State(state): State<Arc<AppState>>,
    Query(q): Query<DayQuery>,
) -> Result<Json<Vec<PresenceEntry>>, (StatusCode, Json<ApiError>)> {
    let day = q.day.unwrap_or_else(today);
    let roster = server_api::today_roster(&state.api, day)
        .await
        .map_err(reject)?;
    Ok(Json(roster))
}

async fn http_my_presence(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserDayQuery>,
) -> Result<Json<Option<PresencePayload>>, (StatusCode, Json<ApiError>)> {
    let day = q.day.unwrap_or_else(today);
    let presence = server_api::my_presence(&state.api, UserId(q.user_id), day)
        .await
        .map_err(reject)?;
    Ok(Json(presence))
}

async fn http_upsert_presence(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpsertPresenceRequest>,
) -> Result<Json<PresenceEntry>, (StatusCode, Json<ApiError>)> {
    let actor = request.user_id;
    let (event, entry) = server_api::upsert_presence(&state.api, request)
        .await
        .map_err(reject)?;
    let _ = state.events.send(event);

    // Best-effort side channel; never gates the submit result.
    let push = state.push.clone();
    let storage = state.api.storage.clone();
    let (am, pm) = (entry.am, entry.pm);
    tokio::spawn(async move {
        push.notify_presence_change(&storage, actor, am, pm).await;
    });

    Ok(Json(entry))
}

async fn http_remove_presence(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserDayQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let day = q.day.unwrap_or_else(today);
    let event = server_api::remove_presence(&state.api, UserId(q.user_id), day)
        .await
        .map_err(reject)?;
    if let Some(event) = event {
        let _ = state.events.send(event);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_get_profile(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<ProfilePayload>, (StatusCode, Json<ApiError>)> {
    let profile = server_api::profile_for(&state.api, UserId(user_id))
        .await
        .map_err(reject)?
        .ok_or_else(|| reject(ApiError::not_found("profile not found")))?;
    Ok(Json(profile))
}

async fn http_update_profile(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(profile): Json<ProfilePayload>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let event = server_api::update_profile(&state.api, UserId(q.user_id), profile)
        .await
        .map_err(reject)?;
    let _ = state.events.send(event);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_subscribe_push(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(subscription): Json<PushSubscriptionPayload>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    server_api::subscribe_push(&state.api, UserId(q.user_id), subscription)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match error.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use shared::domain::ChangeKind;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<AppState>, i64) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let user = storage.create_user("alice").await.expect("user");
        let api = ApiContext { storage };
        let (events, _) = broadcast::channel(32);
        let push = PushDispatcher::new(false, Duration::from_millis(100));
        let state = Arc::new(AppState { api, events, push });
        (build_router(Arc::clone(&state)), state, user.0)
    }

    fn upsert_request(user_id: i64, am: bool, pm: bool) -> Request<Body> {
        let body = serde_json::json!({
            "user_id": user_id,
            "day": "2026-08-26",
            "am": am,
            "pm": pm,
        });
        Request::post("/presences")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn upsert_broadcasts_insert_then_update() {
        let (app, state, user_id) = test_app().await;
        let mut events = state.events.subscribe();

        let response = app
            .clone()
            .oneshot(upsert_request(user_id, true, false))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let event = events.recv().await.expect("event");
        assert!(matches!(
            event,
            ServerEvent::PresenceChanged {
                kind: ChangeKind::Insert,
                ..
            }
        ));

        let response = app
            .clone()
            .oneshot(upsert_request(user_id, false, true))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let event = events.recv().await.expect("event");
        assert!(matches!(
            event,
            ServerEvent::PresenceChanged {
                kind: ChangeKind::Update,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_as_unauthenticated() {
        let (app, _state, _user_id) = test_app().await;
        let response = app
            .oneshot(upsert_request(999, true, false))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn remove_presence_broadcasts_delete_only_when_a_row_existed() {
        let (app, state, user_id) = test_app().await;
        let mut events = state.events.subscribe();

        let absent = Request::delete(format!("/presences?user_id={user_id}&day=2026-08-26"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(absent).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        app.clone()
            .oneshot(upsert_request(user_id, false, false))
            .await
            .expect("response");
        let _ = events.recv().await.expect("insert event");

        let present = Request::delete(format!("/presences?user_id={user_id}&day=2026-08-26"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(present).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let event = events.recv().await.expect("delete event");
        assert!(matches!(
            event,
            ServerEvent::PresenceChanged {
                kind: ChangeKind::Delete,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn profile_is_missing_until_updated() {
        let (app, _state, user_id) = test_app().await;

        let missing = Request::get(format!("/profiles/{user_id}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(missing).await.expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let update = Request::post(format!("/profiles?user_id={user_id}"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "first_name": "Alice" }).to_string(),
            ))
            .expect("request");
        let response = app.clone().oneshot(update).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let fetched = Request::get(format!("/profiles/{user_id}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(fetched).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn push_subscription_requires_a_complete_shape() {
        let (app, _state, user_id) = test_app().await;
        let incomplete = Request::post(format!("/push/subscriptions?user_id={user_id}"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "endpoint": "", "p256dh": "k", "auth": "a" }).to_string(),
            ))
            .expect("request");
        let response = app.clone().oneshot(incomplete).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let complete = Request::post(format!("/push/subscriptions?user_id={user_id}"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "endpoint": "https://push/ep", "p256dh": "k", "auth": "a" })
                    .to_string(),
            ))
            .expect("request");
        let response = app.oneshot(complete).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn blank_login_is_rejected() {
        let (app, _state, _user_id) = test_app().await;
        let request = Request::post("/login")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "username": "  " }).to_string(),
            ))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
