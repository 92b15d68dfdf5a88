use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AccessDecision, BundleOutcome, ChatReply, ChatTranscript, ConnectionDescriptor, ErrorKind,
    FileListing, FilePayload, SelectionSet, SharedResource, ShareToken,
};
use crate::services::backend::AccessScope;
use crate::services::chat::{ChatRelay, ChatSession};
use crate::services::connection::ConnectionSynthesizer;
use crate::services::files::{DownloadRegistry, FileSetManager};
use crate::services::resolver::TokenResolver;

// ============================================================================
// Gate State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    Resolving,
    PasswordRequired,
    Granted,
    /// Granted with at least one sub-operation running.
    Serving,
    Denied,
    Expired,
}

impl GateState {
    pub fn from_decision(decision: &AccessDecision) -> Self {
        match decision.reason {
            _ if decision.allowed => GateState::Granted,
            Some(ErrorKind::Expired) => GateState::Expired,
            Some(kind) if kind.is_terminal() => GateState::Denied,
            _ if decision.requires_password => GateState::PasswordRequired,
            _ => GateState::Denied,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GateState::Denied | GateState::Expired)
    }
}

// ============================================================================
// Gate Session
// ============================================================================

struct GateCore {
    state: GateState,
    decision: Option<AccessDecision>,
    /// Kept only once it has unlocked the resource.
    password: Option<String>,
}

/// Everything one user holds while viewing a shared link.
pub struct GateSession {
    pub id: Uuid,
    token: ShareToken,
    credential: Option<String>,
    gate: RwLock<GateCore>,
    active: AtomicUsize,
    selection: Mutex<SelectionSet>,
    listing: Mutex<Option<FileListing>>,
    chat: ChatSession,
    downloads: DownloadRegistry,
    last_seen: Mutex<Instant>,
}

impl GateSession {
    pub fn new(token: ShareToken, credential: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            token,
            credential: credential
                .filter(|c| !c.trim().is_empty())
                .map(str::to_string),
            gate: RwLock::new(GateCore {
                state: GateState::Resolving,
                decision: None,
                password: None,
            }),
            active: AtomicUsize::new(0),
            selection: Mutex::new(SelectionSet::default()),
            listing: Mutex::new(None),
            chat: ChatSession::default(),
            downloads: DownloadRegistry::default(),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last_seen = *self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        now.saturating_duration_since(last_seen)
    }

    /// True while a sub-operation or chat question is running.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0 || self.chat.is_busy()
    }

    pub fn downloads(&self) -> &DownloadRegistry {
        &self.downloads
    }

    fn selection(&self) -> MutexGuard<'_, SelectionSet> {
        self.selection.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached_listing(&self) -> Option<FileListing> {
        self.listing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn cache_listing(&self, listing: &FileListing) {
        *self.listing.lock().unwrap_or_else(|e| e.into_inner()) = Some(listing.clone());
    }

    pub async fn state(&self) -> GateState {
        let core = self.gate.read().await;
        match core.state {
            GateState::Granted if self.active.load(Ordering::SeqCst) > 0 => GateState::Serving,
            state => state,
        }
    }

    pub async fn view(&self) -> GateView {
        let state = self.state().await;
        let core = self.gate.read().await;
        GateView {
            id: self.id,
            state,
            decision: core.decision.clone(),
            selection: self.selection().to_vec(),
            active_operations: self.active.load(Ordering::SeqCst),
        }
    }
}

/// Session state as returned to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct GateView {
    pub id: Uuid,
    pub state: GateState,
    pub decision: Option<AccessDecision>,
    pub selection: Vec<String>,
    pub active_operations: usize,
}

/// An unlocked resource plus the scope to reach it with.
#[derive(Debug, Clone)]
pub struct Grant {
    pub scope: AccessScope,
    pub resource: SharedResource,
}

/// Keeps the session in `Serving` for as long as it lives.
#[derive(Debug)]
pub struct ServingGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ServingGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Access Gate
// ============================================================================

/// Sequences resolution, the password challenge and every sub-operation.
#[derive(Clone)]
pub struct AccessGate {
    resolver: TokenResolver,
    files: FileSetManager,
    chat: ChatRelay,
    connections: ConnectionSynthesizer,
}

impl AccessGate {
    pub fn new(
        resolver: TokenResolver,
        files: FileSetManager,
        chat: ChatRelay,
        connections: ConnectionSynthesizer,
    ) -> Self {
        Self {
            resolver,
            files,
            chat,
            connections,
        }
    }

    /// Resolve a fresh session. Leaves it in `Resolving` on upstream failure.
    pub async fn enter(
        &self,
        session: &GateSession,
        password: Option<&str>,
    ) -> AppResult<AccessDecision> {
        let mut core = session.gate.write().await;
        let decision = self
            .resolver
            .resolve(&session.token, password, session.credential.as_deref())
            .await?;

        core.state = GateState::from_decision(&decision);
        if decision.allowed {
            core.password = password.filter(|p| !p.is_empty()).map(str::to_string);
        }
        core.decision = Some(decision.clone());
        session.touch();

        tracing::info!(
            "Gate session {} for share {} entered state {:?}",
            session.id,
            session.token.fingerprint(),
            core.state
        );
        Ok(decision)
    }

    /// Submit a password. Only valid while the gate asks for one.
    ///
    /// The write lock is held across the backend round trip, so no
    /// sub-operation can observe a half-updated gate.
    pub async fn submit_password(
        &self,
        session: &GateSession,
        password: &str,
    ) -> AppResult<AccessDecision> {
        let mut core = session.gate.write().await;
        if core.state != GateState::PasswordRequired {
            return Err(AppError::Conflict(format!(
                "password submission not accepted in state {:?}",
                core.state
            )));
        }
        if password.is_empty() {
            return Err(AppError::Validation("password cannot be empty".to_string()));
        }

        let decision = self
            .resolver
            .resolve(&session.token, Some(password), session.credential.as_deref())
            .await?;

        core.state = GateState::from_decision(&decision);
        if decision.allowed {
            core.password = Some(password.to_string());
        }
        core.decision = Some(decision.clone());
        session.touch();

        tracing::info!(
            "Password submission for gate session {} -> {:?}",
            session.id,
            core.state
        );
        Ok(decision)
    }

    /// Snapshot the grant and mark the session as serving.
    pub async fn grant<'a>(&self, session: &'a GateSession) -> AppResult<(Grant, ServingGuard<'a>)> {
        let core = session.gate.read().await;
        session.touch();

        let decision = core.decision.as_ref();
        match core.state {
            GateState::Granted | GateState::Serving => {}
            GateState::PasswordRequired => return Err(AppError::PasswordRequired),
            GateState::Expired => return Err(AppError::Expired),
            GateState::Denied => return Err(AppError::from_denial(decision.and_then(|d| d.reason))),
            GateState::Resolving => {
                return Err(AppError::Conflict("shared link is still resolving".to_string()))
            }
        }

        let (tier, resource) = match decision {
            Some(AccessDecision {
                tier,
                resource: Some(resource),
                ..
            }) => (*tier, resource.clone()),
            _ => {
                return Err(AppError::Internal(anyhow::anyhow!(
                    "granted gate session {} has no resource",
                    session.id
                )))
            }
        };

        session.active.fetch_add(1, Ordering::SeqCst);
        let guard = ServingGuard {
            active: &session.active,
        };

        let scope = AccessScope::new(
            session.token.clone(),
            tier,
            core.password.as_deref(),
            session.credential.as_deref(),
        );
        Ok((Grant { scope, resource }, guard))
    }

    pub async fn resource(&self, session: &GateSession) -> AppResult<SharedResource> {
        let (grant, _serving) = self.grant(session).await?;
        Ok(grant.resource)
    }

    pub async fn connection(&self, session: &GateSession) -> AppResult<ConnectionDescriptor> {
        let (grant, _serving) = self.grant(session).await?;
        Ok(self.connections.synthesize(
            &grant.resource.resource_type,
            &grant.resource.name,
            &grant.scope.token,
        ))
    }

    fn require_multi_file(resource: &SharedResource) -> AppResult<()> {
        if resource.is_multi_file {
            Ok(())
        } else {
            Err(AppError::BadRequest(
                "resource is a single file; use the direct download".to_string(),
            ))
        }
    }

    async fn fetch_listing(&self, session: &GateSession, grant: &Grant) -> AppResult<FileListing> {
        let listing = self.files.list_files(&grant.scope).await?;
        session.cache_listing(&listing);
        Ok(listing)
    }

    async fn listing(&self, session: &GateSession, grant: &Grant) -> AppResult<FileListing> {
        match session.cached_listing() {
            Some(listing) => Ok(listing),
            None => self.fetch_listing(session, grant).await,
        }
    }

    /// Refresh the file listing. The selection is left as it is.
    pub async fn list_files(&self, session: &GateSession) -> AppResult<FileListing> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;
        self.fetch_listing(session, &grant).await
    }

    pub async fn selection(&self, session: &GateSession) -> AppResult<SelectionSet> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;
        Ok(session.selection().clone())
    }

    pub async fn toggle(&self, session: &GateSession, file_id: &str) -> AppResult<SelectionSet> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;

        let listing = self.listing(session, &grant).await?;
        let mut selection = session.selection();
        // Deselecting a file that dropped out of the listing is still allowed.
        if !listing.contains(file_id) && !selection.contains(file_id) {
            return Err(AppError::NotFound(format!("file {}", file_id)));
        }
        selection.toggle(file_id);
        Ok(selection.clone())
    }

    pub async fn select_all(&self, session: &GateSession) -> AppResult<SelectionSet> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;

        let listing = self.listing(session, &grant).await?;
        let mut selection = session.selection();
        selection.select_all(listing.ids());
        Ok(selection.clone())
    }

    pub async fn clear_selection(&self, session: &GateSession) -> AppResult<SelectionSet> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;

        let mut selection = session.selection();
        selection.clear();
        Ok(selection.clone())
    }

    pub async fn download_one(&self, session: &GateSession, file_id: &str) -> AppResult<FilePayload> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;

        let listing = self.listing(session, &grant).await?;
        if !listing.contains(file_id) {
            return Err(AppError::NotFound(format!("file {}", file_id)));
        }
        self.files.download_one(&grant.scope, file_id).await
    }

    /// Download the current selection. Per-file outcomes are in the report.
    pub async fn download_bundle(&self, session: &GateSession) -> AppResult<BundleOutcome> {
        let (grant, _serving) = self.grant(session).await?;
        Self::require_multi_file(&grant.resource)?;

        let listing = self.listing(session, &grant).await?;
        let selected = session.selection().to_vec();
        self.files
            .download_selected(&grant.scope, &selected, &listing, &session.downloads)
            .await
    }

    pub fn cancel_download(&self, session: &GateSession, file_id: &str) -> AppResult<()> {
        session.touch();
        if session.downloads.cancel(file_id) {
            tracing::info!("Cancelled download of file {} in session {}", file_id, session.id);
            Ok(())
        } else {
            Err(AppError::NotFound(format!("no download in flight for file {}", file_id)))
        }
    }

    pub async fn download_resource(&self, session: &GateSession) -> AppResult<FilePayload> {
        let (grant, _serving) = self.grant(session).await?;
        if grant.resource.is_multi_file {
            return Err(AppError::BadRequest(
                "resource has multiple files; download them individually or as a bundle"
                    .to_string(),
            ));
        }
        self.files.download_resource(&grant.scope).await
    }

    async fn primary_file_id(
        &self,
        session: &GateSession,
        grant: &Grant,
    ) -> AppResult<Option<String>> {
        if !grant.resource.is_multi_file {
            return Ok(None);
        }
        Ok(self.listing(session, grant).await?.primary_file_id)
    }

    /// Ask about the resource. Multi-file resources are scoped to the primary
    /// file, looked up only once the question holds the chat session.
    pub async fn ask(&self, session: &GateSession, message: &str) -> AppResult<ChatReply> {
        let (grant, _serving) = self.grant(session).await?;

        self.chat
            .ask(
                &grant.scope,
                &grant.resource,
                self.primary_file_id(session, &grant),
                &session.chat,
                message,
            )
            .await
    }

    pub async fn transcript(&self, session: &GateSession) -> AppResult<ChatTranscript> {
        let (_grant, _serving) = self.grant(session).await?;
        Ok(session.chat.transcript())
    }

    pub async fn clear_transcript(&self, session: &GateSession) -> AppResult<()> {
        let (_grant, _serving) = self.grant(session).await?;
        session.chat.clear()
    }
}
