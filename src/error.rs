use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::models::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Password required")]
    PasswordRequired,

    #[error("Invalid password")]
    InvalidCredential,

    #[error("Organization authentication required")]
    RequiresAuthTier,

    #[error("Shared link has expired")]
    Expired,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl AppError {
    /// Position of this error in the user-facing taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AppError::PasswordRequired | AppError::InvalidCredential => {
                Some(ErrorKind::InvalidCredential)
            }
            AppError::RequiresAuthTier => Some(ErrorKind::RequiresAuthTier),
            AppError::Expired => Some(ErrorKind::Expired),
            AppError::NotFound(_) => Some(ErrorKind::NotFound),
            AppError::Upstream(_) => Some(ErrorKind::Upstream),
            _ => None,
        }
    }

    /// Error for a denial carried by an access decision.
    pub fn from_denial(reason: Option<ErrorKind>) -> Self {
        match reason {
            Some(ErrorKind::Expired) => AppError::Expired,
            Some(ErrorKind::NotFound) => AppError::NotFound("shared link".to_string()),
            Some(ErrorKind::RequiresAuthTier) => AppError::RequiresAuthTier,
            Some(ErrorKind::InvalidCredential) => AppError::InvalidCredential,
            Some(ErrorKind::Upstream) => {
                AppError::Upstream("shared link could not be resolved".to_string())
            }
            Some(ErrorKind::PartialFailure) | None => {
                AppError::Forbidden("shared link is not accessible".to_string())
            }
        }
    }

    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::PasswordRequired => (
                StatusCode::UNAUTHORIZED,
                "PASSWORD_REQUIRED",
                self.to_string(),
            ),
            AppError::InvalidCredential => (
                StatusCode::UNAUTHORIZED,
                "INVALID_CREDENTIAL",
                self.to_string(),
            ),
            AppError::RequiresAuthTier => (
                StatusCode::FORBIDDEN,
                "REQUIRES_AUTH_TIER",
                self.to_string(),
            ),
            AppError::Expired => (StatusCode::GONE, "EXPIRED", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                self.to_string(),
            ),
            AppError::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Upstream(msg) => {
                tracing::error!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR", msg.clone())
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

fn render(error: &AppError, details: Option<serde_json::Value>) -> Response {
    let (status, code, message) = error.parts();

    let body = ErrorResponse {
        error: ErrorBody {
            code: code.to_string(),
            message,
            details,
        },
    };

    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        render(&self, None)
    }
}

impl AppError {
    pub fn with_details(self, details: serde_json::Value) -> AppErrorWithDetails {
        AppErrorWithDetails {
            error: self,
            details: Some(details),
        }
    }
}

pub struct AppErrorWithDetails {
    error: AppError,
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppErrorWithDetails {
    fn into_response(self) -> Response {
        render(&self.error, self.details)
    }
}

impl From<AppError> for AppErrorWithDetails {
    fn from(error: AppError) -> Self {
        AppErrorWithDetails {
            error,
            details: None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn expired_renders_gone() {
        let response = AppError::Expired.into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "EXPIRED");
    }

    #[tokio::test]
    async fn details_are_attached() {
        let response = AppError::Upstream("all files failed".to_string())
            .with_details(serde_json::json!({ "failed": ["f1"] }))
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["details"]["failed"][0], "f1");
    }

    #[test]
    fn denial_reasons_map_to_terminal_errors() {
        assert!(matches!(
            AppError::from_denial(Some(ErrorKind::Expired)),
            AppError::Expired
        ));
        assert!(matches!(
            AppError::from_denial(Some(ErrorKind::RequiresAuthTier)),
            AppError::RequiresAuthTier
        ));
        assert_eq!(
            AppError::from_denial(Some(ErrorKind::NotFound)).kind(),
            Some(ErrorKind::NotFound)
        );
    }
}
