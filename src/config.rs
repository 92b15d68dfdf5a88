use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub connection: ConnectionConfig,
    pub chat: ChatConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Origin allowed by CORS (the dashboard UI).
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the backend share API, e.g. `https://api.example.com/v1`.
    pub api_url: String,
    /// Transport timeout for every backend call.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Gate sessions idle for longer than this are destroyed.
    pub idle_ttl_seconds: u64,
    /// How often the reaper scans for idle sessions.
    pub reap_interval_seconds: u64,
    /// Upper bound of live gate sessions.
    pub max_sessions: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for session creation and password submission
    pub unlock_per_second: u32,
    /// Burst size for session creation and password submission
    pub unlock_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Host of the read-only data proxy shown in connection descriptors.
    pub proxy_host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub max_message_chars: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Parallel per-file downloads inside one bundle.
    pub concurrency: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                frontend_url: env::var("FRONTEND_URL")
                    .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            },
            backend: BackendConfig {
                api_url: env::var("SHARE_API_URL")
                    .map_err(|_| ConfigError::MissingEnv("SHARE_API_URL".to_string()))?,
                timeout_seconds: env::var("BACKEND_TIMEOUT_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            session: SessionConfig {
                idle_ttl_seconds: env::var("SESSION_IDLE_TTL_SECONDS")
                    .unwrap_or_else(|_| "1800".to_string())
                    .parse()
                    .unwrap_or(1800),
                reap_interval_seconds: env::var("SESSION_REAP_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .unwrap_or(60),
                max_sessions: env::var("MAX_SESSIONS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()
                    .unwrap_or(10_000),
            },
            rate_limit: RateLimitConfig {
                unlock_per_second: env::var("RATE_LIMIT_UNLOCK_PER_SECOND")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
                unlock_burst: env::var("RATE_LIMIT_UNLOCK_BURST")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            connection: ConnectionConfig {
                proxy_host: env::var("PROXY_HOST")
                    .unwrap_or_else(|_| "proxy.localhost".to_string()),
            },
            chat: ChatConfig {
                max_message_chars: env::var("CHAT_MAX_MESSAGE_CHARS")
                    .unwrap_or_else(|_| "4000".to_string())
                    .parse()
                    .unwrap_or(4000),
            },
            download: DownloadConfig {
                concurrency: env::var("DOWNLOAD_CONCURRENCY")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse::<usize>()
                    .map(|n| n.max(1))
                    .unwrap_or(4),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
            },
            backend: BackendConfig {
                api_url: "http://localhost:8000/api".to_string(),
                timeout_seconds: 30,
            },
            session: SessionConfig {
                idle_ttl_seconds: 1800,
                reap_interval_seconds: 60,
                max_sessions: 10_000,
            },
            rate_limit: RateLimitConfig {
                unlock_per_second: 2,
                unlock_burst: 10,
            },
            connection: ConnectionConfig {
                proxy_host: "proxy.localhost".to_string(),
            },
            chat: ChatConfig {
                max_message_chars: 4000,
            },
            download: DownloadConfig { concurrency: 4 },
        }
    }
}
