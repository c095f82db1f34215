use std::panic::{AssertUnwindSafe, resume_unwind};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Error, Result,
    admin::AdminAccess,
    binder::{self, BoundContext},
    catalog::{Catalog, ConnLookup},
    context::{HostMapping, RequestParts, extract_candidate},
    metrics,
    protected::{Products, Sales},
    schema::SchemaManager,
    scope::{Branch, ScopeKind, Tenant},
    tools::CatalogTools,
    validator::{Resolution, Validator},
};

/// Whether a route may run without a bound scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoutePolicy {
    RequireScope,
    /// Runs unbound when no candidate is present. A candidate that is present
    /// is still validated.
    Exempt,
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    admin_pool: Option<PgPool>,
    hosts: HostMapping,
    request_timeout: Option<Duration>,
}

impl Store {
    pub async fn connect(url: &str) -> Result<Self> {
        StoreBuilder::new(url).build().await
    }

    pub fn builder(url: impl Into<String>) -> StoreBuilder {
        StoreBuilder::new(url)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn hosts(&self) -> &HostMapping {
        &self.hosts
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn catalog<K: ScopeKind>(&self) -> Catalog<K> {
        Catalog::new(self.pool.clone())
    }

    pub fn tenants(&self) -> Catalog<Tenant> {
        self.catalog()
    }

    pub fn branches(&self) -> Catalog<Branch> {
        self.catalog()
    }

    pub fn products(&self) -> Products {
        Products
    }

    pub fn sales(&self) -> Sales {
        Sales
    }

    pub fn tools<K: ScopeKind>(&self) -> CatalogTools<K> {
        CatalogTools::new(self.catalog())
    }

    pub fn schema(&self) -> SchemaManager {
        SchemaManager::new(self.pool.clone())
    }

    /// Cross-scope access for maintenance. Every use is audited.
    pub fn admin(&self, reason: impl Into<String>) -> Result<AdminAccess> {
        let pool = self.admin_pool.clone().ok_or(Error::AdminUnavailable)?;
        Ok(AdminAccess::new(pool, reason))
    }

    /// Lightweight liveness check for the connection pool.
    pub async fn pool_health(&self) -> Result<PoolHealth> {
        let one: i32 = sqlx::query_scalar("select 1").fetch_one(&self.pool).await?;
        Ok(PoolHealth { ok: one == 1 })
    }

    /// Checks out a connection and binds the scope the request names.
    ///
    /// The candidate is validated against the catalog before anything is
    /// written to the connection. On rejection the connection is cleared and
    /// returned before the error is reported.
    #[instrument(skip_all, fields(kind = K::NAME, path = %parts.path))]
    pub async fn begin<K: ScopeKind>(
        &self,
        parts: &RequestParts,
        policy: RoutePolicy,
    ) -> Result<BoundContext<K>> {
        let mut ctx = BoundContext::<K>::checkout(&self.pool).await?;
        ctx.resolving();

        let resolution = self.resolve::<K>(&mut ctx, parts, policy).await;
        match resolution {
            Ok(Resolution::Resolved(scope)) => {
                if let Err(err) = ctx.bind(scope).await {
                    metrics::metrics().record_rejection(err.kind());
                    return Err(err);
                }
                metrics::metrics().record_request(true);
                Ok(ctx)
            }
            Ok(Resolution::NoContext) => {
                ctx.unbound();
                metrics::metrics().record_request(false);
                debug!(target: "rowguard::gate", "running without scope");
                Ok(ctx)
            }
            Err(err) => {
                ctx.rejected();
                metrics::metrics().record_rejection(err.kind());
                if err.kind().is_internal() {
                    error!(target: "rowguard::gate", error = %err, "scope resolution failed");
                } else {
                    info!(target: "rowguard::gate", code = err.kind().code(), error = %err, "request rejected");
                }
                ctx.release().await?;
                Err(err)
            }
        }
    }

    async fn resolve<K: ScopeKind>(
        &self,
        ctx: &mut BoundContext<K>,
        parts: &RequestParts,
        policy: RoutePolicy,
    ) -> Result<Resolution<K>> {
        let candidate = extract_candidate::<K>(parts, &self.hosts);
        if candidate.is_none() && policy == RoutePolicy::RequireScope {
            return Err(Error::MissingScope { kind: K::NAME });
        }
        Validator::new(ConnLookup::<K>::new(ctx.conn()?))
            .resolve(candidate.as_ref(), &parts.principal)
            .await
    }

    /// Binds a known scope id for work that does not start from a request,
    /// such as jobs and the CLI.
    pub async fn bind_scope<K: ScopeKind>(&self, id: K::Id) -> Result<BoundContext<K>> {
        let mut ctx = BoundContext::<K>::checkout(&self.pool).await?;
        ctx.resolving();
        let lookup = Validator::new(ConnLookup::<K>::new(ctx.conn()?))
            .resolve_id(id)
            .await;
        match lookup {
            Ok(scope) => {
                ctx.bind(scope).await?;
                Ok(ctx)
            }
            Err(err) => {
                ctx.rejected();
                ctx.release().await?;
                Err(err)
            }
        }
    }

    /// Runs `handler` inside a bound context and releases the context however
    /// the handler ends.
    ///
    /// A handler that exceeds the request timeout is cancelled and its
    /// connection closed. A handler that panics has its context released
    /// before the panic continues.
    pub async fn run_scoped<K, T, F>(
        &self,
        parts: &RequestParts,
        policy: RoutePolicy,
        handler: F,
    ) -> Result<T>
    where
        K: ScopeKind,
        F: for<'c> FnOnce(&'c mut BoundContext<K>) -> BoxFuture<'c, Result<T>>,
    {
        let mut ctx = self.begin::<K>(parts, policy).await?;
        let outcome = {
            let fut = AssertUnwindSafe(handler(&mut ctx)).catch_unwind();
            match self.request_timeout {
                Some(limit) => tokio::time::timeout(limit, fut)
                    .await
                    .map_err(|_| Error::Timeout(limit)),
                None => Ok(fut.await),
            }
        };

        match outcome {
            Err(timeout) => {
                warn!(target: "rowguard::gate", kind = K::NAME, "handler timed out");
                ctx.abandon();
                Err(timeout)
            }
            Ok(Err(panic)) => {
                error!(target: "rowguard::gate", kind = K::NAME, "handler panicked; releasing context");
                if let Err(err) = ctx.release().await {
                    error!(target: "rowguard::gate", error = %err, "release after panic failed");
                }
                resume_unwind(panic)
            }
            Ok(Ok(result)) => {
                let released = ctx.release().await;
                let value = result?;
                released?;
                Ok(value)
            }
        }
    }
}

pub struct StoreBuilder {
    url: String,
    max_connections: Option<u32>,
    acquire_timeout: Option<Duration>,
    hosts: HostMapping,
    request_timeout: Option<Duration>,
    admin_url: Option<String>,
}

impl StoreBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: None,
            acquire_timeout: None,
            hosts: HostMapping::disabled(),
            request_timeout: None,
            admin_url: None,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max.max(1));
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    pub fn host_mapping(mut self, hosts: HostMapping) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Connection string for a role that bypasses row policies. Without it,
    /// [`Store::admin`] is unavailable.
    pub fn admin_url(mut self, url: impl Into<String>) -> Self {
        self.admin_url = Some(url.into());
        self
    }

    pub async fn build(self) -> Result<Store> {
        let mut opts = PgPoolOptions::new().after_release(|conn, _meta| {
            Box::pin(async move {
                match binder::clear_all(conn).await {
                    Ok(()) => Ok(true),
                    Err(err) => {
                        error!(target: "rowguard::binder", error = %err, "reset on release failed; closing connection");
                        metrics::metrics().record_clear_failure();
                        Ok(false)
                    }
                }
            })
        });
        if let Some(max) = self.max_connections {
            opts = opts.max_connections(max);
        }
        if let Some(t) = self.acquire_timeout {
            opts = opts.acquire_timeout(t);
        }
        let pool = opts.connect(&self.url).await?;

        let admin_pool = match &self.admin_url {
            Some(url) => Some(
                PgPoolOptions::new()
                    .max_connections(2)
                    .connect(url)
                    .await?,
            ),
            None => None,
        };

        Ok(Store {
            pool,
            admin_pool,
            hosts: self.hosts,
            request_timeout: self.request_timeout,
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PoolHealth {
    pub ok: bool,
}
