use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{AccessDecision, AccessTier, ErrorKind, SharedResource, ShareToken};
use crate::services::backend::{AccessScope, BackendError, BackendResult, ShareBackend};

/// What the resolver does after one backend answer.
#[derive(Debug)]
pub(crate) enum Transition {
    /// Try again at the next tier.
    Escalate(AccessTier),
    Decide(AccessDecision),
    Fail(AppError),
}

/// Facts about the caller that the transition depends on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt {
    pub password_supplied: bool,
    pub has_credential: bool,
    pub now: DateTime<Utc>,
}

/// Tier state machine. Only `AccessTier::escalate` can produce a retry, so
/// every tier is tried at most once and Public is always first.
pub(crate) fn transition(
    tier: AccessTier,
    outcome: BackendResult<SharedResource>,
    attempt: &Attempt,
) -> Transition {
    match outcome {
        Ok(resource) if resource.is_expired(attempt.now) => {
            Transition::Decide(AccessDecision::denied(tier, ErrorKind::Expired))
        }
        Ok(resource) => Transition::Decide(AccessDecision::granted(tier, resource)),
        Err(BackendError::AuthorizationRequired) => match tier.escalate() {
            Some(next) if attempt.has_credential => Transition::Escalate(next),
            _ => Transition::Decide(AccessDecision::denied(tier, ErrorKind::RequiresAuthTier)),
        },
        Err(BackendError::PasswordRequired) | Err(BackendError::InvalidPassword) => {
            if attempt.password_supplied {
                Transition::Decide(AccessDecision::invalid_password(tier))
            } else {
                Transition::Decide(AccessDecision::password_required(tier))
            }
        }
        Err(BackendError::Expired) => {
            Transition::Decide(AccessDecision::denied(tier, ErrorKind::Expired))
        }
        Err(BackendError::NotFound) => {
            Transition::Decide(AccessDecision::denied(tier, ErrorKind::NotFound))
        }
        Err(BackendError::Upstream(msg)) => Transition::Fail(AppError::Upstream(msg)),
    }
}

/// Turns a capability token into an [`AccessDecision`].
#[derive(Clone)]
pub struct TokenResolver {
    backend: Arc<dyn ShareBackend>,
}

impl TokenResolver {
    pub fn new(backend: Arc<dyn ShareBackend>) -> Self {
        Self { backend }
    }

    /// Resolve `token`, starting at the public tier.
    ///
    /// Backend and network failures come back as `AppError::Upstream`; every
    /// other outcome, including denials, is an `Ok` decision.
    pub async fn resolve(
        &self,
        token: &ShareToken,
        password: Option<&str>,
        credential: Option<&str>,
    ) -> AppResult<AccessDecision> {
        let scope = AccessScope::new(token.clone(), AccessTier::Public, password, credential);
        let attempt = Attempt {
            password_supplied: scope.password.is_some(),
            has_credential: scope.credential.is_some(),
            now: Utc::now(),
        };

        let mut tier = AccessTier::Public;
        loop {
            let outcome = self.backend.resolve(&scope.at_tier(tier)).await;

            match transition(tier, outcome, &attempt) {
                Transition::Escalate(next) => {
                    tracing::debug!(
                        "Share {} requires authentication, escalating {} -> {}",
                        token.fingerprint(),
                        tier.as_str(),
                        next.as_str()
                    );
                    tier = next;
                }
                Transition::Decide(decision) => {
                    tracing::info!(
                        "Resolved share {} at tier {}: allowed={} requires_password={} reason={:?}",
                        token.fingerprint(),
                        decision.tier.as_str(),
                        decision.allowed,
                        decision.requires_password,
                        decision.reason
                    );
                    return Ok(decision);
                }
                Transition::Fail(error) => {
                    tracing::warn!(
                        "Failed to resolve share {} at tier {}: {}",
                        token.fingerprint(),
                        tier.as_str(),
                        error
                    );
                    return Err(error);
                }
            }
        }
    }
}
