use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::{
    Error, Result,
    context::HostMapping,
    schema::SchemaConfig,
    store::Store,
};

/// Which scope a deployment isolates by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    Tenant,
    Branch,
}

/// Runtime configuration. Every flag falls back to its environment variable.
#[derive(Clone, Debug, Args)]
pub struct Config {
    /// Postgres connection string for the application role.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Connection string for a role with BYPASSRLS. Enables the audited admin path.
    #[arg(long, env = "ROWGUARD_ADMIN_URL")]
    pub admin_url: Option<String>,

    #[arg(long, env = "ROWGUARD_DEPLOYMENT", value_enum, default_value_t = Deployment::Tenant)]
    pub deployment: Deployment,

    /// Maps `<slug>.<domain>` hosts onto scopes.
    #[arg(long, env = "ROWGUARD_BASE_DOMAIN")]
    pub base_domain: Option<String>,

    #[arg(long, env = "ROWGUARD_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Per-request deadline in milliseconds; 0 disables it.
    #[arg(long, env = "ROWGUARD_REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Role granted access to the managed tables by `schema-sync`.
    #[arg(long, env = "ROWGUARD_APP_ROLE")]
    pub app_role: Option<String>,

    #[arg(long, env = "ROWGUARD_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// Schema holding the managed tables.
    #[arg(long, default_value = "public")]
    pub schema: String,
}

impl Config {
    pub fn database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| Error::InvalidInput("--database-url or env DATABASE_URL is required".into()))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn host_mapping(&self) -> HostMapping {
        match self.base_domain.as_deref() {
            Some(domain) => HostMapping::base_domain(domain),
            None => HostMapping::disabled(),
        }
    }

    pub fn schema_config(&self) -> SchemaConfig {
        let config = SchemaConfig::with_schema(self.schema.clone());
        match &self.app_role {
            Some(role) => config.app_role(role.clone()),
            None => config,
        }
    }

    pub async fn connect(&self) -> Result<Store> {
        let mut builder = Store::builder(self.database_url()?)
            .max_connections(self.max_connections)
            .host_mapping(self.host_mapping());
        if let Some(timeout) = self.request_timeout() {
            builder = builder.request_timeout(timeout);
        }
        if let Some(url) = &self.admin_url {
            builder = builder.admin_url(url.clone());
        }
        builder.build().await
    }
}
