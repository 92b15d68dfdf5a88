use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{AbortHandle, Abortable};
use futures::stream::{self, StreamExt};

use crate::error::{AppError, AppResult};
use crate::models::{
    BundleOutcome, BundleReport, BundledFile, ErrorKind, FileEntry, FileFailure, FileListing,
    FilePayload,
};
use crate::services::backend::{AccessScope, BackendError, ShareBackend};

/// Abort handles of in-flight file downloads.
///
/// Handles are keyed by file id and then by bundle run, so two bundles that
/// fetch the same file never touch each other's handle.
#[derive(Default)]
pub struct DownloadRegistry {
    handles: Mutex<HashMap<String, HashMap<u64, AbortHandle>>>,
    next_run: AtomicU64,
}

impl DownloadRegistry {
    fn start_run(&self) -> u64 {
        self.next_run.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, run: u64, file_id: &str, handle: AbortHandle) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(file_id.to_string())
            .or_default()
            .insert(run, handle);
    }

    fn finish(&self, run: u64, file_id: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(runs) = handles.get_mut(file_id) {
            runs.remove(&run);
            if runs.is_empty() {
                handles.remove(file_id);
            }
        }
    }

    /// Cancel every in-flight download of one file. Sibling files keep running.
    pub fn cancel(&self, file_id: &str) -> bool {
        let runs = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(file_id);
        match runs {
            Some(runs) => {
                for handle in runs.values() {
                    handle.abort();
                }
                !runs.is_empty()
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let drained: Vec<AbortHandle> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, runs)| runs.into_values())
            .collect();
        for handle in &drained {
            handle.abort();
        }
        drained.len()
    }

    #[cfg(test)]
    pub fn is_active(&self, file_id: &str) -> bool {
        self.active_runs(file_id) > 0
    }

    #[cfg(test)]
    pub fn active_runs(&self, file_id: &str) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(file_id)
            .map_or(0, HashMap::len)
    }
}

/// Listing and retrieval for multi-file shares.
#[derive(Clone)]
pub struct FileSetManager {
    backend: Arc<dyn ShareBackend>,
    concurrency: usize,
}

impl FileSetManager {
    pub fn new(backend: Arc<dyn ShareBackend>, concurrency: usize) -> Self {
        Self {
            backend,
            concurrency: concurrency.max(1),
        }
    }

    /// Fetch the listing. An empty listing is a valid "no files" state.
    pub async fn list_files(&self, scope: &AccessScope) -> AppResult<FileListing> {
        let entries = self.backend.list_files(scope).await?;
        let flagged = entries.iter().filter(|f| f.is_primary).count();
        if flagged > 1 {
            tracing::warn!(
                "Share {} lists {} primary files, keeping the first",
                scope.token.fingerprint(),
                flagged
            );
        }

        Ok(FileListing::from_entries(entries))
    }

    pub async fn download_one(&self, scope: &AccessScope, file_id: &str) -> AppResult<FilePayload> {
        self.backend
            .download_file(scope, file_id)
            .await
            .map_err(AppError::from)
    }

    /// Direct download of a single-file resource.
    pub async fn download_resource(&self, scope: &AccessScope) -> AppResult<FilePayload> {
        self.backend
            .download_resource(scope)
            .await
            .map_err(AppError::from)
    }

    /// Download every selected file concurrently.
    ///
    /// Each file succeeds or fails on its own; a failure or cancellation is
    /// recorded in the report and never aborts the other downloads.
    pub async fn download_selected(
        &self,
        scope: &AccessScope,
        selected: &[String],
        listing: &FileListing,
        downloads: &DownloadRegistry,
    ) -> AppResult<BundleOutcome> {
        if selected.is_empty() {
            return Err(AppError::Validation("no files selected".to_string()));
        }

        let mut report = BundleReport::default();
        let mut jobs: Vec<FileEntry> = Vec::with_capacity(selected.len());
        for file_id in selected {
            match listing.get(file_id) {
                Some(entry) => jobs.push(entry.clone()),
                None => report.failed.push(FileFailure {
                    file_id: file_id.clone(),
                    filename: None,
                    kind: ErrorKind::NotFound,
                    message: "file is not part of this share".to_string(),
                    cancelled: false,
                }),
            }
        }

        let backend = &self.backend;
        let run = downloads.start_run();
        let mut results: Vec<(FileEntry, Option<Result<FilePayload, BackendError>>)> =
            stream::iter(jobs)
                .map(|entry| async move {
                    let (handle, registration) = AbortHandle::new_pair();
                    downloads.register(run, &entry.id, handle);
                    let result =
                        Abortable::new(backend.download_file(scope, &entry.id), registration)
                            .await
                            .ok();
                    downloads.finish(run, &entry.id);
                    (entry, result)
                })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
        results.sort_by(|a, b| a.0.id.cmp(&b.0.id));

        let mut files = Vec::new();
        for (entry, result) in results {
            match result {
                Some(Ok(payload)) => {
                    report.succeeded.push(BundledFile {
                        file_id: entry.id.clone(),
                        filename: entry.filename.clone(),
                        size_bytes: payload.bytes.len() as u64,
                    });
                    files.push(FilePayload {
                        filename: entry.filename,
                        ..payload
                    });
                }
                Some(Err(e)) => {
                    tracing::warn!("Bundle download of file {} failed: {}", entry.id, e);
                    let error = AppError::from(e);
                    report.failed.push(FileFailure {
                        file_id: entry.id,
                        filename: Some(entry.filename),
                        kind: error.kind().unwrap_or(ErrorKind::Upstream),
                        message: error.to_string(),
                        cancelled: false,
                    });
                }
                None => {
                    tracing::info!("Bundle download of file {} cancelled", entry.id);
                    report.failed.push(FileFailure {
                        file_id: entry.id,
                        filename: Some(entry.filename),
                        kind: ErrorKind::Upstream,
                        message: "download cancelled".to_string(),
                        cancelled: true,
                    });
                }
            }
        }

        report.failed.sort_by(|a, b| a.file_id.cmp(&b.file_id));

        tracing::info!(
            "Bundle for share {}: {} succeeded, {} failed (kind={:?})",
            scope.token.fingerprint(),
            report.succeeded.len(),
            report.failed.len(),
            report.kind()
        );

        Ok(BundleOutcome { files, report })
    }
}
