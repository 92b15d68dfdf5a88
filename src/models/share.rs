use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

// ============================================================================
// Share Token
// ============================================================================

/// Opaque capability token taken from a shared link.
///
/// The gateway never interprets the token; it only forwards it to the backend.
/// `Debug` prints a fingerprint so tokens do not end up in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ShareToken(String);

impl ShareToken {
    pub fn parse(raw: &str) -> AppResult<Self> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(AppError::Validation(
                "share token cannot be empty".to_string(),
            ));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short SHA-256 fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl fmt::Debug for ShareToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareToken({})", self.fingerprint())
    }
}

// ============================================================================
// Access Tier
// ============================================================================

/// Authentication context under which a token is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Public,
    OrganizationAuthenticated,
}

impl AccessTier {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessTier::Public => "public",
            AccessTier::OrganizationAuthenticated => "organization_authenticated",
        }
    }

    /// The tier tried after this one, if any. Public escalates exactly once.
    pub fn escalate(self) -> Option<AccessTier> {
        match self {
            AccessTier::Public => Some(AccessTier::OrganizationAuthenticated),
            AccessTier::OrganizationAuthenticated => None,
        }
    }

    /// Backend path prefix for share endpoints at this tier.
    pub fn path_prefix(self) -> &'static str {
        match self {
            AccessTier::Public => "/public",
            AccessTier::OrganizationAuthenticated => "",
        }
    }
}

// ============================================================================
// Error Kind
// ============================================================================

/// Failure taxonomy visible to the UI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Wrong password. Recoverable by re-prompting.
    InvalidCredential,
    /// Organization authentication is required and was not satisfied.
    RequiresAuthTier,
    Expired,
    NotFound,
    /// Transient backend or network failure; safe to retry manually.
    Upstream,
    /// A subset of a multi-file bundle failed.
    PartialFailure,
}

impl ErrorKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::Expired | ErrorKind::NotFound | ErrorKind::RequiresAuthTier
        )
    }
}

// ============================================================================
// Shared Resource
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    #[default]
    Dataset,
    Connector,
}

/// Metadata of the dataset or connector a token points at. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedResource {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub kind: ResourceKind,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub column_count: Option<u64>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub enable_chat: bool,
    #[serde(default)]
    pub is_multi_file: bool,
    #[serde(default)]
    pub password_protected: bool,
}

impl SharedResource {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

// ============================================================================
// Access Decision
// ============================================================================

/// Outcome of one resolution call. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub tier: AccessTier,
    pub requires_password: bool,
    pub reason: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<SharedResource>,
}

impl AccessDecision {
    pub fn granted(tier: AccessTier, resource: SharedResource) -> Self {
        Self {
            allowed: true,
            tier,
            requires_password: false,
            reason: None,
            resource: Some(resource),
        }
    }

    pub fn password_required(tier: AccessTier) -> Self {
        Self {
            allowed: false,
            tier,
            requires_password: true,
            reason: None,
            resource: None,
        }
    }

    pub fn invalid_password(tier: AccessTier) -> Self {
        Self {
            allowed: false,
            tier,
            requires_password: true,
            reason: Some(ErrorKind::InvalidCredential),
            resource: None,
        }
    }

    pub fn denied(tier: AccessTier, reason: ErrorKind) -> Self {
        Self {
            allowed: false,
            tier,
            requires_password: false,
            reason: Some(reason),
            resource: None,
        }
    }
}
