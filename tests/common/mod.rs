#![allow(dead_code)]

use std::time::Duration;

use anyhow::Result;
use rowguard::{Store, testing};
use testcontainers::{
    ContainerAsync, GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

pub struct Database {
    _container: ContainerAsync<GenericImage>,
    pub owner_url: String,
    pub app_url: String,
}

impl Database {
    /// Application store, connected as the role row policies apply to.
    pub async fn store(&self) -> Result<Store> {
        Ok(Store::builder(&self.app_url)
            .max_connections(4)
            .admin_url(&self.owner_url)
            .build()
            .await?)
    }

    /// Store with a single pooled connection so every checkout reuses it.
    pub async fn single_connection_store(&self) -> Result<Store> {
        Ok(Store::builder(&self.app_url)
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .build()
            .await?)
    }
}

/// Starts Postgres, provisions the managed schema and the application role.
pub async fn start() -> Result<Database> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");

    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let owner_url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    // The server restarts once after initdb; retry until the final instance is up.
    let mut attempts = 0;
    loop {
        match testing::provision(&owner_url).await {
            Ok(_) => break,
            Err(_) if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(err) => return Err(err.into()),
        }
    }

    let app_url = testing::app_url(&owner_url)?;
    Ok(Database {
        _container: container,
        owner_url,
        app_url,
    })
}
