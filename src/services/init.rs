//! Initialization helpers for the application:
//! - backend client and gate wiring
//! - background worker spawn helpers
//!
//! This module centralizes bits that used to live in `main.rs`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::config::Config;
use crate::services::backend::{HttpShareBackend, ShareBackend};
use crate::services::chat::ChatRelay;
use crate::services::connection::ConnectionSynthesizer;
use crate::services::files::FileSetManager;
use crate::services::gate::AccessGate;
use crate::services::resolver::TokenResolver;

/// Redact potentially sensitive information from a backend URL before logging.
///
/// Attempts to parse the URL and remove userinfo and query components.
/// Falls back to removing everything before '@' or returning "(redacted)".
pub fn redact_api_url(api_url: &str) -> String {
    if let Ok(url) = url::Url::parse(api_url) {
        let scheme = url.scheme();
        let host = url.host_str().unwrap_or("");
        let port_part = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        let path = url.path();
        format!("{}://{}{}{}", scheme, host, port_part, path)
    } else {
        if let Some(at_pos) = api_url.find('@') {
            let without_creds = &api_url[at_pos + 1..];
            return format!("(redacted){}", without_creds);
        }
        "(redacted)".to_string()
    }
}

/// Wire the gate and its components against the HTTP backend.
pub fn build_gate(config: &Config) -> Result<AccessGate> {
    tracing::info!(
        "Using share backend at {}",
        redact_api_url(&config.backend.api_url)
    );
    let backend: Arc<dyn ShareBackend> = Arc::new(HttpShareBackend::new(&config.backend)?);

    Ok(gate_with_backend(config, backend))
}

pub fn gate_with_backend(config: &Config, backend: Arc<dyn ShareBackend>) -> AccessGate {
    AccessGate::new(
        TokenResolver::new(backend.clone()),
        FileSetManager::new(backend.clone(), config.download.concurrency),
        ChatRelay::new(backend, config.chat.max_message_chars),
        ConnectionSynthesizer::new(config.connection.proxy_host.clone()),
    )
}

/// Spawn background workers:
/// - periodic reaping of idle gate sessions
///
/// The function returns a vector of `JoinHandle<()>`s so callers can await
/// task shutdown. Each worker listens for a shutdown notification via a
/// `tokio::sync::broadcast::Sender<()>`.
pub fn spawn_background_workers(
    state: Arc<crate::AppState>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Session reaper
    {
        let mut shutdown_rx = shutdown.subscribe();
        let state = state.clone();
        let interval = Duration::from_secs(state.config.session.reap_interval_seconds.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Session reaper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                let reaped = state.sessions.reap_idle(Instant::now());
                if reaped > 0 {
                    tracing::info!(
                        "Reaped {} idle sessions, {} remaining",
                        reaped,
                        state.sessions.count()
                    );
                } else {
                    tracing::debug!("No idle sessions to reap");
                }
            }
        }));
    }

    handles
}
