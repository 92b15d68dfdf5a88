use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::config::BackendConfig;
use crate::error::{AppError, AppResult};
use crate::models::{AccessTier, ChatReply, ChatRequest, FileEntry, FilePayload, SharedResource, ShareToken};

/// Header carrying the plaintext share password to the backend.
pub const PASSWORD_HEADER: &str = "x-share-password";

/// How the backend answered a share call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("authorization required")]
    AuthorizationRequired,

    #[error("password required")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    #[error("shared link expired")]
    Expired,

    #[error("shared resource not found")]
    NotFound,

    #[error("{0}")]
    Upstream(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

impl From<BackendError> for AppError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::AuthorizationRequired => AppError::RequiresAuthTier,
            BackendError::PasswordRequired => AppError::PasswordRequired,
            BackendError::InvalidPassword => AppError::InvalidCredential,
            BackendError::Expired => AppError::Expired,
            BackendError::NotFound => AppError::NotFound("shared resource".to_string()),
            BackendError::Upstream(msg) => AppError::Upstream(msg),
        }
    }
}

/// Everything a backend call is scoped by: token, tier and the caller's secrets.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessScope {
    pub token: ShareToken,
    pub tier: AccessTier,
    pub password: Option<String>,
    pub credential: Option<String>,
}

impl AccessScope {
    pub fn new(
        token: ShareToken,
        tier: AccessTier,
        password: Option<&str>,
        credential: Option<&str>,
    ) -> Self {
        Self {
            token,
            tier,
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            credential: credential.filter(|c| !c.is_empty()).map(str::to_string),
        }
    }

    pub fn at_tier(&self, tier: AccessTier) -> Self {
        Self {
            tier,
            ..self.clone()
        }
    }
}

impl fmt::Debug for AccessScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessScope")
            .field("token", &self.token)
            .field("tier", &self.tier)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Share endpoints of the backend collaborator.
#[async_trait]
pub trait ShareBackend: Send + Sync + 'static {
    async fn resolve(&self, scope: &AccessScope) -> BackendResult<SharedResource>;

    async fn list_files(&self, scope: &AccessScope) -> BackendResult<Vec<FileEntry>>;

    async fn download_file(&self, scope: &AccessScope, file_id: &str)
        -> BackendResult<FilePayload>;

    /// Download a single-file resource directly.
    async fn download_resource(&self, scope: &AccessScope) -> BackendResult<FilePayload>;

    async fn chat(&self, scope: &AccessScope, request: &ChatRequest) -> BackendResult<ChatReply>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Clone)]
pub struct HttpShareBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorEnvelopeBody,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelopeBody {
    code: Option<String>,
}

impl HttpShareBackend {
    pub fn new(config: &BackendConfig) -> AppResult<Self> {
        let base = Url::parse(&config.api_url)
            .map_err(|e| AppError::Config(format!("Invalid SHARE_API_URL: {}", e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(AppError::Config(format!(
                "Unsupported SHARE_API_URL scheme: {}",
                base.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn share_url(&self, scope: &AccessScope, suffix: &str) -> String {
        format!(
            "{}{}/shared/{}{}",
            self.base_url,
            scope.tier.path_prefix(),
            urlencoding::encode(scope.token.as_str()),
            suffix
        )
    }

    fn request(&self, method: Method, url: &str, scope: &AccessScope) -> RequestBuilder {
        let mut request = self.client.request(method, url);

        if let Some(ref password) = scope.password {
            request = request.header(PASSWORD_HEADER, password);
        }

        // The session credential is only ever presented at the organization tier.
        if scope.tier == AccessTier::OrganizationAuthenticated {
            if let Some(ref credential) = scope.credential {
                request = request.bearer_auth(credential);
            }
        }

        request
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> BackendResult<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Upstream(format!("Failed to {}: {}", action, e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

/// Map a non-success backend response onto [`BackendError`].
///
/// The error code in the JSON envelope wins over the status code.
pub fn classify_failure(status: StatusCode, body: &str) -> BackendError {
    let code = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .and_then(|envelope| envelope.error.code)
        .map(|code| code.to_ascii_uppercase());

    match code.as_deref() {
        Some("PASSWORD_REQUIRED") => return BackendError::PasswordRequired,
        Some("INVALID_PASSWORD") | Some("INVALID_CREDENTIAL") => {
            return BackendError::InvalidPassword
        }
        Some("EXPIRED") => return BackendError::Expired,
        Some("NOT_FOUND") => return BackendError::NotFound,
        Some("UNAUTHORIZED") | Some("FORBIDDEN") => return BackendError::AuthorizationRequired,
        _ => {}
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::AuthorizationRequired,
        StatusCode::NOT_FOUND => BackendError::NotFound,
        StatusCode::GONE => BackendError::Expired,
        _ => BackendError::Upstream(format!("Backend error ({}): {}", status, body)),
    }
}

fn filename_from_disposition(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
        .filter(|name| !name.is_empty())
}

async fn into_payload(response: Response, fallback_name: &str) -> BackendResult<FilePayload> {
    let filename = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
        .unwrap_or_else(|| fallback_name.to_string());
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| BackendError::Upstream(format!("Failed to read download body: {}", e)))?;

    Ok(FilePayload {
        filename,
        content_type,
        bytes,
    })
}

#[async_trait]
impl ShareBackend for HttpShareBackend {
    async fn resolve(&self, scope: &AccessScope) -> BackendResult<SharedResource> {
        let url = self.share_url(scope, "");
        let response = self
            .send(self.request(Method::GET, &url, scope), "resolve shared link")
            .await?;

        response
            .json::<SharedResource>()
            .await
            .map_err(|e| BackendError::Upstream(format!("Invalid shared resource payload: {}", e)))
    }

    async fn list_files(&self, scope: &AccessScope) -> BackendResult<Vec<FileEntry>> {
        let url = self.share_url(scope, "/files");
        let response = self
            .send(self.request(Method::GET, &url, scope), "list shared files")
            .await?;

        response
            .json::<Vec<FileEntry>>()
            .await
            .map_err(|e| BackendError::Upstream(format!("Invalid file listing payload: {}", e)))
    }

    async fn download_file(
        &self,
        scope: &AccessScope,
        file_id: &str,
    ) -> BackendResult<FilePayload> {
        let url = self.share_url(
            scope,
            &format!("/files/{}/download", urlencoding::encode(file_id)),
        );
        let response = self
            .send(self.request(Method::GET, &url, scope), "download shared file")
            .await?;

        into_payload(response, file_id).await
    }

    async fn download_resource(&self, scope: &AccessScope) -> BackendResult<FilePayload> {
        let url = self.share_url(scope, "/download");
        let response = self
            .send(self.request(Method::GET, &url, scope), "download shared resource")
            .await?;

        into_payload(response, "download").await
    }

    async fn chat(&self, scope: &AccessScope, request: &ChatRequest) -> BackendResult<ChatReply> {
        let url = self.share_url(scope, "/chat");
        let response = self
            .send(
                self.request(Method::POST, &url, scope).json(request),
                "send chat message",
            )
            .await?;

        response
            .json::<ChatReply>()
            .await
            .map_err(|e| BackendError::Upstream(format!("Invalid chat reply payload: {}", e)))
    }
}
