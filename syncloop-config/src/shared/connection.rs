use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Session parameters applied to every Postgres connection of the run store.
const SESSION_OPTIONS: &[(&str, &str)] = &[
    ("datestyle", "ISO"),
    ("intervalstyle", "postgres"),
    ("client_encoding", "UTF8"),
    ("timezone", "UTC"),
];

/// Connection settings for the Postgres database backing the durable run store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port on which the Postgres server is listening.
    pub port: u16,
    /// Name of the database holding the `syncloop` schema.
    pub name: String,
    /// Username used to authenticate.
    pub username: String,
    /// Password for [`PgConnectionConfig::username`], redacted in debug output.
    pub password: Option<SerializableSecretString>,
    /// TLS settings.
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    /// Validates the connection settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }
}

/// TLS settings for Postgres connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
    /// Whether TLS is required.
    #[serde(default)]
    pub enabled: bool,
}

impl TlsConfig {
    /// Returns [`ValidationError::MissingTrustedRootCerts`] if TLS is enabled without certificates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Converts a connection config into driver specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Options for connecting to the server without selecting a database.
    ///
    /// Useful for administrative statements such as creating the database.
    fn without_db(&self) -> Output;

    /// Options for connecting to [`PgConnectionConfig::name`].
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<PgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            PgSslMode::VerifyFull
        } else {
            PgSslMode::Prefer
        };

        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .ssl_mode(ssl_mode)
            .options(SESSION_OPTIONS.iter().copied());

        if self.tls.enabled {
            options = options.ssl_root_cert_from_pem(self.tls.trusted_root_certs.clone().into_bytes());
        }

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }

    fn with_db(&self) -> PgConnectOptions {
        self.without_db().database(&self.name)
    }
}
