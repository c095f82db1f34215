pub mod error;
pub mod handlers;
pub mod middleware;

use std::sync::Arc;

use axum::{Router, middleware::from_fn_with_state, routing::get};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    Result,
    config::{Config, Deployment},
    scope::{Branch, Tenant},
    store::{RoutePolicy, Store},
};

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use middleware::{RequestScope, scope_layer};

/// API paths that run without a scope. Everything outside `/api/` is exempt already.
pub const DEFAULT_EXEMPT_PATHS: &[&str] = &["/api/context-status/"];

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    exempt: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(store: Store) -> Self {
        Self::with_exempt_paths(store, DEFAULT_EXEMPT_PATHS.iter().copied())
    }

    pub fn with_exempt_paths<I, S>(store: Store, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            exempt: Arc::new(paths.into_iter().map(Into::into).collect()),
        }
    }

    /// Paths outside `/api/` never require a scope.
    pub fn route_policy(&self, path: &str) -> RoutePolicy {
        route_policy(&self.exempt, path)
    }
}

fn route_policy(exempt: &[String], path: &str) -> RoutePolicy {
    if !path.starts_with("/api/") || exempt.iter().any(|p| p == path) {
        RoutePolicy::Exempt
    } else {
        RoutePolicy::RequireScope
    }
}

pub fn router(state: AppState, deployment: Deployment) -> Router {
    let api = match deployment {
        Deployment::Tenant => Router::new()
            .route(
                "/api/products/",
                get(handlers::list_products).post(handlers::create_product),
            )
            .route(
                "/api/context-status/",
                get(handlers::context_status::<Tenant>),
            )
            .layer(from_fn_with_state(state.clone(), scope_layer::<Tenant>)),
        Deployment::Branch => Router::new()
            .route("/api/branches/", get(handlers::list_branches))
            .route("/api/sales/", get(handlers::list_sales))
            .route("/api/sales-summary/", get(handlers::sales_summary))
            .route(
                "/api/context-status/",
                get(handlers::context_status::<Branch>),
            )
            .layer(from_fn_with_state(state.clone(), scope_layer::<Branch>)),
    };

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics_text))
        .merge(api)
        .with_state(state)
}

pub async fn serve(config: &Config) -> Result<()> {
    let store = config.connect().await?;
    let app = router(AppState::new(store), config.deployment);
    let listener = TcpListener::bind(config.bind).await?;
    info!(addr = %config.bind, deployment = ?config.deployment, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}
