//! In-memory `ShareBackend` used by service and route tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::models::{AccessTier, ChatReply, ChatRequest, FileEntry, FilePayload, SharedResource};
use crate::services::backend::{AccessScope, BackendError, BackendResult, ShareBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Resolve(AccessTier),
    ListFiles,
    Download(String),
    DownloadResource,
    Chat(ChatRequest),
}

pub struct FakeBackend {
    public: Mutex<BackendResult<SharedResource>>,
    organization: BackendResult<SharedResource>,
    password: Option<String>,
    files: Vec<FileEntry>,
    failing_files: HashSet<String>,
    slow_files: HashSet<String>,
    download_delay: Option<Duration>,
    listing_error: Option<BackendError>,
    resolve_hold: Mutex<Option<Arc<Notify>>>,
    chat: BackendResult<ChatReply>,
    calls: Mutex<Vec<BackendCall>>,
}

pub fn resource(name: &str, resource_type: &str) -> SharedResource {
    SharedResource {
        id: format!("{}-id", name),
        name: name.to_string(),
        kind: Default::default(),
        resource_type: resource_type.to_string(),
        size_bytes: Some(2048),
        row_count: Some(100),
        column_count: Some(4),
        owner: Some("acme".to_string()),
        expires_at: None,
        enable_chat: true,
        is_multi_file: false,
        password_protected: false,
    }
}

pub fn file(id: &str, primary: bool) -> FileEntry {
    FileEntry {
        id: id.to_string(),
        filename: format!("{}.csv", id),
        file_type: Some("csv".to_string()),
        size_bytes: 16,
        is_primary: primary,
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            public: Mutex::new(Err(BackendError::AuthorizationRequired)),
            organization: Err(BackendError::AuthorizationRequired),
            password: None,
            files: Vec::new(),
            failing_files: HashSet::new(),
            slow_files: HashSet::new(),
            download_delay: None,
            listing_error: None,
            resolve_hold: Mutex::new(None),
            chat: Err(BackendError::Upstream("chat not configured".to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_public(self, result: BackendResult<SharedResource>) -> Self {
        self.set_public(result);
        self
    }

    /// Change what the Public tier answers from now on.
    pub fn set_public(&self, result: BackendResult<SharedResource>) {
        *self.public.lock().unwrap() = result;
    }

    pub fn with_organization(mut self, result: BackendResult<SharedResource>) -> Self {
        self.organization = result;
        self
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_files(mut self, files: Vec<FileEntry>) -> Self {
        self.files = files;
        self
    }

    pub fn failing(mut self, file_id: &str) -> Self {
        self.failing_files.insert(file_id.to_string());
        self
    }

    /// Downloads of this file hang until cancelled.
    pub fn slow(mut self, file_id: &str) -> Self {
        self.slow_files.insert(file_id.to_string());
        self
    }

    /// Every file download takes at least this long.
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = Some(delay);
        self
    }

    pub fn with_listing_error(mut self, error: BackendError) -> Self {
        self.listing_error = Some(error);
        self
    }

    /// Park every later `resolve` call until the returned notifier fires.
    pub fn hold_resolves(&self) -> Arc<Notify> {
        let hold = Arc::new(Notify::new());
        *self.resolve_hold.lock().unwrap() = Some(hold.clone());
        hold
    }

    pub fn with_chat(mut self, result: BackendResult<ChatReply>) -> Self {
        self.chat = result;
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn resolved_tiers(&self) -> Vec<AccessTier> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Resolve(tier) => Some(tier),
                _ => None,
            })
            .collect()
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Chat(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }

    /// Expiry and missing tokens win over the password check, like the real backend.
    fn check_password(&self, scope: &AccessScope) -> BackendResult<()> {
        match (&self.password, &scope.password) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(BackendError::PasswordRequired),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (Some(_), Some(_)) => Err(BackendError::InvalidPassword),
        }
    }
}

#[async_trait]
impl ShareBackend for FakeBackend {
    async fn resolve(&self, scope: &AccessScope) -> BackendResult<SharedResource> {
        self.record(BackendCall::Resolve(scope.tier));

        let hold = self.resolve_hold.lock().unwrap().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }

        let result = match scope.tier {
            AccessTier::Public => self.public.lock().unwrap().clone(),
            AccessTier::OrganizationAuthenticated => self.organization.clone(),
        };

        match result {
            Err(BackendError::Expired) | Err(BackendError::NotFound) => result,
            Err(BackendError::AuthorizationRequired) => result,
            other => {
                self.check_password(scope)?;
                other
            }
        }
    }

    async fn list_files(&self, scope: &AccessScope) -> BackendResult<Vec<FileEntry>> {
        self.record(BackendCall::ListFiles);
        self.check_password(scope)?;
        if let Some(error) = &self.listing_error {
            return Err(error.clone());
        }
        Ok(self.files.clone())
    }

    async fn download_file(
        &self,
        scope: &AccessScope,
        file_id: &str,
    ) -> BackendResult<FilePayload> {
        self.record(BackendCall::Download(file_id.to_string()));
        self.check_password(scope)?;

        if let Some(delay) = self.download_delay {
            tokio::time::sleep(delay).await;
        }
        if self.slow_files.contains(file_id) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing_files.contains(file_id) {
            return Err(BackendError::Upstream(format!(
                "storage error for {}",
                file_id
            )));
        }

        let entry = self
            .files
            .iter()
            .find(|f| f.id == file_id)
            .ok_or(BackendError::NotFound)?;

        Ok(FilePayload {
            filename: entry.filename.clone(),
            content_type: Some("text/csv".to_string()),
            bytes: Bytes::from(format!("contents of {}", file_id)),
        })
    }

    async fn download_resource(&self, scope: &AccessScope) -> BackendResult<FilePayload> {
        self.record(BackendCall::DownloadResource);
        self.check_password(scope)?;

        Ok(FilePayload {
            filename: "resource.csv".to_string(),
            content_type: Some("text/csv".to_string()),
            bytes: Bytes::from_static(b"id,value\n1,2\n"),
        })
    }

    async fn chat(&self, scope: &AccessScope, request: &ChatRequest) -> BackendResult<ChatReply> {
        self.record(BackendCall::Chat(request.clone()));
        self.check_password(scope)?;
        self.chat.clone()
    }
}
