use std::time::Duration;

use config::{Config, ConfigError, File};
use mongodb::Client;
use mongodb::options::{ClientOptions, Credential};
use serde::Deserialize;
use tracing::{debug, instrument};


pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";

/// Full connection string, takes precedence over host and port.
pub const URI_VAR: &str = "MONGODB_URI";
pub const HOST_VAR: &str = "DB_HOST_MONGO";
pub const PORT_VAR: &str = "DB_PORT_MONGO";

#[derive(thiserror::Error, Debug)]
pub enum ConfError {
    #[error("failed to load configuration")]
    Load(#[from] ConfigError),
    #[error("invalid database connection settings")]
    Client(#[from] mongodb::error::Error),
}

/// Load the configuration file (skipped when it does not exist) and apply the
/// connection overrides from the environment.
pub fn load_config(filepath: &str) -> Result<Config, ConfError> {
    load_config_with(filepath, |name| std::env::var(name).ok())
}

/// Same as `load_config`, with environment variables resolved through `lookup`.
pub fn load_config_with<F>(filepath: &str, lookup: F) -> Result<Config, ConfError>
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |name: &str| lookup(name).filter(|value| !value.is_empty());
    let conf = Config::builder()
        .add_source(File::with_name(filepath).required(false))
        .set_override_option("db.uri", non_empty(URI_VAR))?
        .set_override_option("db.host", non_empty(HOST_VAR))?
        .set_override_option("db.port", non_empty(PORT_VAR))?
        .build()?;
    Ok(conf)
}

/// The `db` table of the configuration.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database the provisioned user is stored in. Unset means the target
    /// database.
    pub auth_database: Option<String>,
    pub server_selection_timeout_secs: u64,
    pub app_name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            uri: None,
            host: "localhost".to_string(),
            port: 27017,
            username: None,
            password: None,
            auth_database: None,
            server_selection_timeout_secs: 10,
            app_name: "redsocial-init".to_string(),
        }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("uri", &self.uri.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth_database", &self.auth_database)
            .field(
                "server_selection_timeout_secs",
                &self.server_selection_timeout_secs,
            )
            .field("app_name", &self.app_name)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn from_config(conf: &Config) -> Result<Self, ConfError> {
        match conf.get::<DatabaseConfig>("db") {
            Ok(db_conf) => Ok(db_conf),
            Err(ConfigError::NotFound(_)) => Ok(DatabaseConfig::default()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn uri(&self) -> String {
        match &self.uri {
            Some(uri) => uri.clone(),
            None => format!("mongodb://{}:{}", self.host, self.port),
        }
    }

    pub fn server_selection_timeout(&self) -> Duration {
        Duration::from_secs(self.server_selection_timeout_secs)
    }

    /// Connection credential, when both a username and a password are set.
    /// The driver authenticates it against the URI database or `admin`.
    pub fn credential(&self) -> Option<Credential> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(
                Credential::builder()
                    .username(username.clone())
                    .password(password.clone())
                    .build(),
            ),
            _ => None,
        }
    }
}

/// Build a client for the configured server. The driver connects lazily, so
/// an unreachable server only shows up on the first command.
#[instrument(skip_all, err, fields(host = %db_conf.host, port = db_conf.port))]
pub async fn build_client(db_conf: &DatabaseConfig) -> Result<Client, ConfError> {
    let mut options = ClientOptions::parse(db_conf.uri()).await?;
    options.app_name = Some(db_conf.app_name.clone());
    options.server_selection_timeout = Some(db_conf.server_selection_timeout());
    if let Some(credential) = db_conf.credential() {
        options.credential = Some(credential);
    }
    debug!("building mongodb client");
    let client = Client::with_options(options)?;
    Ok(client)
}
