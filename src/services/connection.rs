use crate::models::{ConnectionDescriptor, ShareToken};

/// Username every proxied connection authenticates as; the token is the secret.
pub const SYNTHETIC_USERNAME: &str = "shared_user";

/// Connector families the proxy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorFamily {
    Relational,
    Document,
    ObjectStorage,
    /// Fallback for every type not listed elsewhere.
    GenericApi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStyle {
    Uri,
    Query,
}

struct FamilyProfile {
    port: u16,
    operations: &'static [&'static str],
    style: ConnectionStyle,
}

const RELATIONAL: FamilyProfile = FamilyProfile {
    port: 10101,
    operations: &["SELECT", "SHOW", "DESCRIBE"],
    style: ConnectionStyle::Uri,
};

const DOCUMENT: FamilyProfile = FamilyProfile {
    port: 10102,
    operations: &["find", "aggregate"],
    style: ConnectionStyle::Uri,
};

const OBJECT_STORAGE: FamilyProfile = FamilyProfile {
    port: 10103,
    operations: &["GET", "LIST"],
    style: ConnectionStyle::Query,
};

const GENERIC_API: FamilyProfile = FamilyProfile {
    port: 10104,
    operations: &["GET"],
    style: ConnectionStyle::Query,
};

impl ConnectorFamily {
    /// Classify a resource/connector type (case-insensitive).
    pub fn of(resource_type: &str) -> Self {
        match normalize(resource_type).as_str() {
            "mysql" | "mariadb" | "postgresql" | "mssql" | "oracle" | "sqlite" | "snowflake"
            | "bigquery" | "redshift" => ConnectorFamily::Relational,
            "mongodb" | "documentdb" | "couchdb" | "dynamodb" => ConnectorFamily::Document,
            "s3" | "gcs" | "azure_blob" | "minio" => ConnectorFamily::ObjectStorage,
            _ => ConnectorFamily::GenericApi,
        }
    }

    // The one place ports and verbs are defined.
    fn profile(self) -> &'static FamilyProfile {
        match self {
            ConnectorFamily::Relational => &RELATIONAL,
            ConnectorFamily::Document => &DOCUMENT,
            ConnectorFamily::ObjectStorage => &OBJECT_STORAGE,
            ConnectorFamily::GenericApi => &GENERIC_API,
        }
    }

    pub fn port(self) -> u16 {
        self.profile().port
    }

    pub fn operations(self) -> &'static [&'static str] {
        self.profile().operations
    }
}

/// Canonical protocol name for a resource type.
fn normalize(resource_type: &str) -> String {
    let lowered = resource_type.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "postgres" | "pg" => "postgresql".to_string(),
        "mongo" => "mongodb".to_string(),
        "sqlserver" | "sql_server" => "mssql".to_string(),
        "azure" | "azureblob" => "azure_blob".to_string(),
        _ => lowered,
    }
}

/// Builds display-only connection descriptors for the read-only data proxy.
#[derive(Debug, Clone)]
pub struct ConnectionSynthesizer {
    host: String,
}

impl ConnectionSynthesizer {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Pure: equal inputs always give equal descriptors.
    pub fn synthesize(
        &self,
        resource_type: &str,
        resource_name: &str,
        token: &ShareToken,
    ) -> ConnectionDescriptor {
        let family = ConnectorFamily::of(resource_type);
        let port = family.port();

        let protocol = match family {
            ConnectorFamily::GenericApi => "https".to_string(),
            _ => normalize(resource_type),
        };

        let name = urlencoding::encode(resource_name);
        let secret = urlencoding::encode(token.as_str());

        let (connection_string, database) = match family.profile().style {
            ConnectionStyle::Uri => (
                format!(
                    "{}://{}:{}@{}:{}/{}",
                    protocol, SYNTHETIC_USERNAME, secret, self.host, port, name
                ),
                Some(resource_name.to_string()),
            ),
            ConnectionStyle::Query if family == ConnectorFamily::ObjectStorage => (
                format!(
                    "{}://{}:{}?bucket={}&access_key={}&secret_key={}",
                    protocol, self.host, port, name, SYNTHETIC_USERNAME, secret
                ),
                None,
            ),
            ConnectionStyle::Query => (
                format!(
                    "{}://{}:{}/shared?resource={}&user={}&token={}",
                    protocol, self.host, port, name, SYNTHETIC_USERNAME, secret
                ),
                None,
            ),
        };

        ConnectionDescriptor {
            protocol,
            host: self.host.clone(),
            port,
            database,
            username: SYNTHETIC_USERNAME.to_string(),
            credential_token: token.as_str().to_string(),
            connection_string,
            supported_operations: family.operations().iter().map(|op| op.to_string()).collect(),
        }
    }
}
