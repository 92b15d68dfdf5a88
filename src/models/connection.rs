use serde::Serialize;

/// Advisory connection settings for an external client.
///
/// Display-only metadata: nothing in the gateway ever dials it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub database: Option<String>,
    pub username: String,
    pub credential_token: String,
    pub connection_string: String,
    pub supported_operations: Vec<String>,
}
