use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppErrorWithDetails, AppResult};
use crate::models::{
    AccessDecision, ChatReply, ChatTranscript, ConnectionDescriptor, ErrorKind, FileListing,
    FilePayload, SelectionSet, ShareToken,
};
use crate::services::bundle;
use crate::services::gate::{GateSession, GateState, GateView};
use crate::AppState;

/// Session-scoped routes once a session exists.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/connection", get(get_connection))
        .route("/sessions/:id/files", get(list_files))
        .route("/sessions/:id/files/:file_id/download", get(download_file))
        .route("/sessions/:id/downloads/:file_id", delete(cancel_download))
        .route("/sessions/:id/download", get(download_resource))
        .route(
            "/sessions/:id/selection",
            get(get_selection).delete(clear_selection),
        )
        .route("/sessions/:id/selection/toggle", post(toggle_selection))
        .route("/sessions/:id/selection/all", post(select_all))
        .route("/sessions/:id/bundle", post(download_bundle))
        .route(
            "/sessions/:id/chat",
            get(get_transcript).post(ask).delete(clear_transcript),
        )
}

/// Routes that reach the resolver with caller-supplied secrets. Rate-limited in `main`.
pub fn unlock_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id/password", post(submit_password))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub token: String,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleRequest {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub message: String,
}

const BUNDLE_SUCCEEDED: &str = "x-bundle-succeeded";
const BUNDLE_FAILED: &str = "x-bundle-failed";

/// Quoted-string safe filename for `Content-Disposition`.
fn disposition_filename(name: &str) -> String {
    bundle::sanitize_filename(name)
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn attachment(filename: &str, content_type: &str, body: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", disposition_filename(filename));
    let content_type = HeaderValue::from_str(content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    response
}

fn file_response(payload: FilePayload) -> Response {
    let content_type = payload
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".to_string());
    attachment(&payload.filename, &content_type, payload.bytes.to_vec())
}

/// Error for a decision that did not unlock the resource.
async fn rejection(session: &GateSession, decision: &AccessDecision) -> AppErrorWithDetails {
    match decision.reason {
        Some(ErrorKind::InvalidCredential) => AppError::InvalidCredential
            .with_details(serde_json::json!({ "session": session.view().await })),
        reason => AppError::from_denial(reason).into(),
    }
}

// ============================================================================
// Gate
// ============================================================================

async fn create_session(
    State(state): State<Arc<AppState>>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<GateView>), AppErrorWithDetails> {
    let token = ShareToken::parse(&req.token)?;
    let credential = bearer.map(|TypedHeader(auth)| auth.token().to_string());

    let session = state
        .sessions
        .insert(GateSession::new(token, credential.as_deref()))?;

    let decision = match state.gate.enter(&session, req.password.as_deref()).await {
        Ok(decision) => decision,
        Err(e) => {
            let _ = state.sessions.remove(session.id);
            return Err(e.into());
        }
    };

    let gate_state = GateState::from_decision(&decision);
    if gate_state.is_terminal() {
        let _ = state.sessions.remove(session.id);
        return Err(AppError::from_denial(decision.reason).into());
    }
    if decision.reason == Some(ErrorKind::InvalidCredential) {
        return Err(rejection(&session, &decision).await);
    }

    Ok((StatusCode::CREATED, Json(session.view().await)))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<GateView>> {
    let session = state.sessions.get(id)?;
    Ok(Json(session.view().await))
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    state.sessions.remove(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit_password(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<PasswordRequest>,
) -> Result<Json<GateView>, AppErrorWithDetails> {
    let session = state.sessions.get(id)?;
    let decision = state.gate.submit_password(&session, &req.password).await?;

    if !decision.allowed {
        return Err(rejection(&session, &decision).await);
    }
    Ok(Json(session.view().await))
}

async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ConnectionDescriptor>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.connection(&session).await?))
}

// ============================================================================
// Files
// ============================================================================

async fn list_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<FileListing>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.list_files(&session).await?))
}

async fn get_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SelectionSet>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.selection(&session).await?))
}

async fn toggle_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ToggleRequest>,
) -> AppResult<Json<SelectionSet>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.toggle(&session, &req.file_id).await?))
}

async fn select_all(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SelectionSet>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.select_all(&session).await?))
}

async fn clear_selection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SelectionSet>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.clear_selection(&session).await?))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((id, file_id)): Path<(Uuid, String)>,
) -> AppResult<Response> {
    let session = state.sessions.get(id)?;
    let payload = state.gate.download_one(&session, &file_id).await?;
    Ok(file_response(payload))
}

async fn cancel_download(
    State(state): State<Arc<AppState>>,
    Path((id, file_id)): Path<(Uuid, String)>,
) -> AppResult<StatusCode> {
    let session = state.sessions.get(id)?;
    state.gate.cancel_download(&session, &file_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_resource(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    let session = state.sessions.get(id)?;
    let payload = state.gate.download_resource(&session).await?;
    Ok(file_response(payload))
}

async fn download_bundle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppErrorWithDetails> {
    let session = state.sessions.get(id)?;
    let outcome = state.gate.download_bundle(&session).await?;

    if outcome.report.all_failed() {
        let details = serde_json::to_value(&outcome.report)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode report: {}", e)))?;
        return Err(AppError::Upstream("every selected file failed to download".to_string())
            .with_details(details));
    }

    if outcome.report.is_partial() {
        tracing::warn!(
            "Serving partial bundle for session {}: {} files failed",
            session.id,
            outcome.report.failed.len()
        );
    }

    let archive = bundle::pack(&outcome)?;
    let resource_name = state
        .gate
        .resource(&session)
        .await
        .map(|r| r.name)
        .unwrap_or_else(|_| "bundle".to_string());

    let mut response = attachment(
        &format!("{}.zip", resource_name),
        "application/zip",
        archive,
    );
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(BUNDLE_SUCCEEDED),
        HeaderValue::from(outcome.report.succeeded.len()),
    );
    headers.insert(
        HeaderName::from_static(BUNDLE_FAILED),
        HeaderValue::from(outcome.report.failed.len()),
    );
    Ok(response)
}

// ============================================================================
// Chat
// ============================================================================

async fn get_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<ChatTranscript>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.transcript(&session).await?))
}

async fn ask(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<AskRequest>,
) -> AppResult<Json<ChatReply>> {
    let session = state.sessions.get(id)?;
    Ok(Json(state.gate.ask(&session, &req.message).await?))
}

async fn clear_transcript(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let session = state.sessions.get(id)?;
    state.gate.clear_transcript(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::SharedResource;
    use crate::services::backend::{BackendError, ShareBackend};
    use crate::services::fake_backend::{file, resource, FakeBackend};
    use crate::services::init::gate_with_backend;
    use crate::services::sessions::SessionStore;
    use axum::body::Body;
    use http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(backend: FakeBackend) -> Router {
        let config = Config::default();
        let backend: Arc<dyn ShareBackend> = Arc::new(backend);
        let state = Arc::new(AppState {
            gate: gate_with_backend(&config, backend),
            sessions: SessionStore::new(&config.session),
            config,
        });

        Router::new()
            .nest("/api/share", router().merge(unlock_router()))
            .with_state(state)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn create(app: &Router, token: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/share/sessions",
                serde_json::json!({ "token": token }),
            ))
            .await
            .unwrap();
        let status = response.status();
        (status, body_json(response).await)
    }

    fn multi_file() -> SharedResource {
        SharedResource {
            is_multi_file: true,
            ..resource("bundle", "csv")
        }
    }

    #[tokio::test]
    async fn create_session_and_fetch_connection() {
        let app = app(FakeBackend::new().with_public(Ok(resource("sales", "mysql"))));

        let (status, body) = create(&app, "abc123").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "granted");
        assert_eq!(body["decision"]["tier"], "public");

        let id = body["id"].as_str().unwrap().to_string();
        let response = app
            .clone()
            .oneshot(empty_request(
                "GET",
                &format!("/api/share/sessions/{}/connection", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let descriptor = body_json(response).await;
        assert_eq!(descriptor["port"], 10101);
        assert_eq!(
            descriptor["supported_operations"],
            serde_json::json!(["SELECT", "SHOW", "DESCRIBE"])
        );
        assert_eq!(
            delete_status(&app, &id).await,
            StatusCode::NO_CONTENT
        );
    }

    async fn delete_status(app: &Router, id: &str) -> StatusCode {
        app.clone()
            .oneshot(empty_request("DELETE", &format!("/api/share/sessions/{}", id)))
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn expired_link_is_gone_and_not_registered() {
        let app = app(FakeBackend::new().with_public(Err(BackendError::Expired)));
        let (status, body) = create(&app, "old").await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["error"]["code"], "EXPIRED");
    }

    #[tokio::test]
    async fn empty_token_is_a_validation_error() {
        let app = app(FakeBackend::new());
        let (status, _) = create(&app, "   ").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn password_challenge_over_http() {
        let app = app(
            FakeBackend::new()
                .with_public(Ok(resource("sales", "mysql")))
                .with_password("s3cret"),
        );

        let (status, body) = create(&app, "xyz789").await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["state"], "password_required");
        let id = body["id"].as_str().unwrap().to_string();
        let uri = format!("/api/share/sessions/{}/password", id);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &uri,
                serde_json::json!({ "password": "wrong" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "INVALID_CREDENTIAL");
        let decision = &body["error"]["details"]["session"]["decision"];
        assert_eq!(decision["allowed"], false);
        assert_eq!(decision["requires_password"], true);
        assert_eq!(decision["tier"], "public");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &uri,
                serde_json::json!({ "password": "s3cret" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["state"], "granted");
    }

    #[tokio::test]
    async fn bundle_with_partial_failure_returns_zip_and_counts() {
        let app = app(
            FakeBackend::new()
                .with_public(Ok(multi_file()))
                .with_files(vec![file("f1", true), file("f2", false), file("f3", false)])
                .failing("f2"),
        );
        let (_, body) = create(&app, "abc123").await;
        let id = body["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/api/share/sessions/{}/selection/all", id),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await, serde_json::json!(["f1", "f2", "f3"]));

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/api/share/sessions/{}/bundle", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/zip");
        assert_eq!(response.headers()[BUNDLE_SUCCEEDED], "2");
        assert_eq!(response.headers()[BUNDLE_FAILED], "1");
    }

    #[tokio::test]
    async fn bundle_where_everything_fails_is_bad_gateway() {
        let app = app(
            FakeBackend::new()
                .with_public(Ok(multi_file()))
                .with_files(vec![file("f1", true)])
                .failing("f1"),
        );
        let (_, body) = create(&app, "abc123").await;
        let id = body["id"].as_str().unwrap().to_string();

        app.clone()
            .oneshot(json_request(
                "POST",
                &format!("/api/share/sessions/{}/selection/toggle", id),
                serde_json::json!({ "file_id": "f1" }),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty_request(
                "POST",
                &format!("/api/share/sessions/{}/bundle", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["details"]["failed"][0]["file_id"], "f1");
    }

    #[tokio::test]
    async fn failed_chat_is_recorded_in_transcript() {
        let app = app(
            FakeBackend::new()
                .with_public(Ok(resource("sales", "mysql")))
                .with_chat(Err(BackendError::Upstream("model offline".to_string()))),
        );
        let (_, body) = create(&app, "abc123").await;
        let id = body["id"].as_str().unwrap().to_string();
        let uri = format!("/api/share/sessions/{}/chat", id);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &uri,
                serde_json::json!({ "message": "how many rows?" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = app.clone().oneshot(empty_request("GET", &uri)).await.unwrap();
        let transcript = body_json(response).await;
        assert_eq!(transcript.as_array().unwrap().len(), 2);
        assert_eq!(transcript[0]["role"], "user");
        assert_eq!(transcript[1]["is_error"], true);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let app = app(FakeBackend::new());
        let response = app
            .oneshot(empty_request(
                "GET",
                &format!("/api/share/sessions/{}", Uuid::new_v4()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn disposition_filename_is_quoted_string_safe() {
        assert_eq!(disposition_filename("q3 \"final\".csv"), "q3 _final_.csv");
        assert_eq!(disposition_filename("отчет.csv"), "_____.csv");
    }
}
