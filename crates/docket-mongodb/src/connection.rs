//! MongoDB connection setup and the command executor built on top of it.
//!
//! # Environment
//! - `DOCKET_MONGODB_URI`: connection string with a default database (required by `from_env`)
//! - `DOCKET_MIN_POOL_SIZE`, `DOCKET_MAX_POOL_SIZE`: pool bounds
//! - `DOCKET_CONNECT_TIMEOUT_SECS`, `DOCKET_SERVER_SELECTION_TIMEOUT_SECS`
//! - `DOCKET_APP_NAME`

use std::str::FromStr;
use std::time::Duration;

use bson::doc;
use docket_common::{DocketError, Result};
use mongodb::options::{ClientOptions, ServerApi, ServerApiVersion};
use mongodb::{Client, Database};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::bulk::CollectionNamespace;
use crate::executor::MongoCommandExecutor;

/// Connection string and pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub uri: String,
    /// Minimum number of pooled connections (default: 0)
    pub min_pool_size: Option<u32>,
    /// Maximum number of pooled connections (default: 10)
    pub max_pool_size: Option<u32>,
    /// Connection timeout (default: 10s)
    pub connect_timeout: Option<Duration>,
    /// Server selection timeout (default: 30s)
    pub server_selection_timeout: Option<Duration>,
    /// Application name for server logs
    pub app_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017/docket".to_string(),
            min_pool_size: Some(0),
            max_pool_size: Some(10),
            connect_timeout: Some(Duration::from_secs(10)),
            server_selection_timeout: Some(Duration::from_secs(30)),
            app_name: Some("docket".to_string()),
        }
    }
}

fn env_number<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => T::from_str(value.trim())
            .map(Some)
            .map_err(|e| {
                DocketError::Configuration(format!("Invalid {} '{}': {}", name, value, e))
            }),
        Err(_) => Ok(None),
    }
}

impl ConnectionConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    /// Read the configuration from `DOCKET_*` environment variables
    pub fn from_env() -> Result<Self> {
        let uri = std::env::var("DOCKET_MONGODB_URI").map_err(|_| {
            DocketError::Configuration("DOCKET_MONGODB_URI is not set".to_string())
        })?;
        let mut config = Self::new(uri);

        if let Some(min) = env_number::<u32>("DOCKET_MIN_POOL_SIZE")? {
            config.min_pool_size = Some(min);
        }
        if let Some(max) = env_number::<u32>("DOCKET_MAX_POOL_SIZE")? {
            config.max_pool_size = Some(max);
        }
        if let Some(secs) = env_number::<u64>("DOCKET_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = env_number::<u64>("DOCKET_SERVER_SELECTION_TIMEOUT_SECS")? {
            config.server_selection_timeout = Some(Duration::from_secs(secs));
        }
        if let Ok(app_name) = std::env::var("DOCKET_APP_NAME") {
            config.app_name = Some(app_name);
        }
        Ok(config)
    }

    pub fn pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_pool_size = Some(min);
        self.max_pool_size = Some(max.max(min).max(1));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }
}

/// Client plus the default database named in the connection string
#[derive(Debug, Clone)]
pub struct Connection {
    client: Client,
    database: Database,
}

impl Connection {
    /// Connect with default pool settings
    pub async fn new(uri: &str) -> Result<Self> {
        Self::with_config(ConnectionConfig::new(uri)).await
    }

    #[instrument(skip(config), fields(app = ?config.app_name))]
    pub async fn with_config(config: ConnectionConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(config.uri.as_str()).await?;

        if let Some(min) = config.min_pool_size {
            options.min_pool_size = Some(min);
        }
        if let Some(max) = config.max_pool_size {
            options.max_pool_size = Some(max);
        }
        if let Some(connect) = config.connect_timeout {
            options.connect_timeout = Some(connect);
        }
        if let Some(selection) = config.server_selection_timeout {
            options.server_selection_timeout = Some(selection);
        }
        if let Some(app) = config.app_name {
            options.app_name = Some(app);
        }
        options.server_api = Some(ServerApi::builder().version(ServerApiVersion::V1).build());

        let client = Client::with_options(options)?;
        let database = client.default_database().ok_or_else(|| {
            DocketError::Connection(
                "No default database specified in connection string".to_string(),
            )
        })?;

        info!(database = %database.name(), "connected");
        Ok(Self { client, database })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// Namespace of a collection in the default database
    pub fn namespace(&self, collection: &str) -> Result<CollectionNamespace> {
        CollectionNamespace::new(self.database.name(), collection)
    }

    /// Executor that runs bulk writes against the default database
    pub fn executor(&self) -> MongoCommandExecutor {
        MongoCommandExecutor::new(self.database.clone())
    }

    pub async fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| DocketError::Connection(format!("Ping failed: {}", e)))
    }
}
