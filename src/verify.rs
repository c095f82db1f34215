use serde::Serialize;
use tracing::{info, warn};

use crate::{
    Result,
    binder::ContextBinder,
    catalog::Catalog,
    context::RequestParts,
    policy::{DEFAULT_POLICY_VERSION, ProtectedTable},
    protected::{NewProduct, NewSale, Products, Sales},
    scope::{Branch, NewScope, Scope, ScopeKind, Tenant},
    store::{RoutePolicy, Store},
};

pub const VERIFY_SLUG_PREFIX: &str = "verify-";
const TENANT_SLUGS: [&str; 2] = ["verify-t1", "verify-t2"];
const BRANCH_SLUGS: [&str; 2] = ["verify-b1", "verify-b2"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passed,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub outcome: Outcome,
    pub detail: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct IsolationReport {
    pub checks: Vec<Check>,
}

impl IsolationReport {
    fn record(&mut self, name: &'static str, passed: bool, detail: impl Into<String>) {
        let outcome = if passed {
            Outcome::Passed
        } else {
            Outcome::Failed
        };
        let detail = detail.into();
        if passed {
            info!(check = name, %detail, "isolation check passed");
        } else {
            warn!(check = name, %detail, "isolation check failed");
        }
        self.checks.push(Check {
            name,
            outcome,
            detail,
        });
    }

    fn skip(&mut self, name: &'static str, detail: impl Into<String>) {
        self.checks.push(Check {
            name,
            outcome: Outcome::Skipped,
            detail: detail.into(),
        });
    }

    pub fn passed(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.checks.iter().filter(|c| c.outcome == outcome).count()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct VerifyOptions {
    pub include_branches: bool,
}

pub async fn verify_isolation(store: &Store, options: VerifyOptions) -> Result<IsolationReport> {
    let mut report = IsolationReport::default();

    let t1 = ensure_scope::<Tenant>(&store.tenants(), TENANT_SLUGS[0], "Verify tenant one").await?;
    let t2 = ensure_scope::<Tenant>(&store.tenants(), TENANT_SLUGS[1], "Verify tenant two").await?;
    seed_products(store, t1.id, &["Product A", "Product B"]).await?;
    seed_products(store, t2.id, &["Product C"]).await?;

    let seen = visible_products(store, t1.id).await?;
    report.record("first tenant sees only its rows", seen == 2, format!("expected 2, saw {seen}"));
    let seen = visible_products(store, t2.id).await?;
    report.record("second tenant sees only its rows", seen == 1, format!("expected 1, saw {seen}"));

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    let cross = Products.count_for(ctx.conn()?, t2.id).await;
    ctx.release().await?;
    let cross = cross?;
    report.record(
        "explicit filter on another tenant returns nothing",
        cross == 0,
        format!("saw {cross} rows of tenant {}", t2.id),
    );

    let mut ctx = store
        .begin::<Tenant>(&RequestParts::default(), RoutePolicy::Exempt)
        .await?;
    let unbound = Products.count(ctx.conn()?).await;
    let malformed = malformed_settings_visibility(ctx.conn()?).await;
    ctx.release().await?;
    let unbound = unbound?;
    report.record("unbound connection sees nothing", unbound == 0, format!("saw {unbound}"));
    let malformed = malformed?;
    report.record(
        "malformed setting fails closed",
        malformed == 0,
        format!("saw {malformed} rows across malformed settings"),
    );

    let (enabled, forced, policy) = row_security_state(store, ProtectedTable::Products).await?;
    report.record(
        "row security enabled, forced and policy installed",
        enabled && forced && policy,
        format!("enabled={enabled} forced={forced} policy={policy}"),
    );

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    let switched = async {
        let conn = ctx.conn()?;
        let first = Products.count(conn).await?;
        ContextBinder::<Tenant>::bind(conn, t2.id).await?;
        let second = Products.count(conn).await?;
        ContextBinder::<Tenant>::bind(conn, t1.id).await?;
        let back = Products.count(conn).await?;
        Ok::<_, crate::Error>((first, second, back))
    }
    .await;
    ctx.release().await?;
    let (first, second, back) = switched?;
    report.record(
        "switching scopes on one connection",
        (first, second, back) == (2, 1, 2),
        format!("saw {first}, then {second}, then {back}"),
    );

    match store.admin("isolation self-check") {
        Ok(admin) => {
            let total = admin.count_all(ProtectedTable::Products).await?;
            report.record(
                "audited admin path sees every tenant",
                total >= 3,
                format!("saw {total} rows in total"),
            );
        }
        Err(_) => report.skip("audited admin path sees every tenant", "no admin connection configured"),
    }

    if options.include_branches {
        verify_branches(store, &mut report).await?;
    }

    info!(
        passed = report.passed(),
        failed = report.failed(),
        "isolation self-check finished"
    );
    Ok(report)
}

async fn verify_branches(store: &Store, report: &mut IsolationReport) -> Result<()> {
    let b1 = ensure_scope::<Branch>(&store.branches(), BRANCH_SLUGS[0], "Verify branch one").await?;
    let b2 = ensure_scope::<Branch>(&store.branches(), BRANCH_SLUGS[1], "Verify branch two").await?;

    for (branch, sales) in [(&b1, 2), (&b2, 1)] {
        let mut ctx = store.bind_scope::<Branch>(branch.id).await?;
        let seeded = async {
            let conn = ctx.conn()?;
            Sales.delete_visible(conn).await?;
            for n in 0..sales {
                Sales
                    .record(conn, NewSale::new(format!("Item {n}"), 1, 500))
                    .await?;
            }
            Sales.summary(conn).await
        }
        .await;
        ctx.release().await?;
        let summary = seeded?;
        report.record(
            "branch sees only its own sales",
            summary.sales == sales,
            format!("branch {} expected {sales}, saw {}", branch.slug, summary.sales),
        );
    }
    Ok(())
}

/// Removes rows seeded by [`verify_isolation`] and deactivates its scopes.
/// Scopes themselves are kept so their keys are never reused.
pub async fn cleanup(store: &Store) -> Result<u64> {
    let mut removed = 0;
    for slug in TENANT_SLUGS {
        if let Some(scope) = store.tenants().find_by_slug(slug).await? {
            if scope.active {
                let mut ctx = store.bind_scope::<Tenant>(scope.id).await?;
                let deleted = Products.delete_visible(ctx.conn()?).await;
                ctx.release().await?;
                removed += deleted?;
                store.tenants().set_active(scope.id, false).await?;
            }
        }
    }
    for slug in BRANCH_SLUGS {
        if let Some(scope) = store.branches().find_by_slug(slug).await? {
            if scope.active {
                let mut ctx = store.bind_scope::<Branch>(scope.id).await?;
                let deleted = Sales.delete_visible(ctx.conn()?).await;
                ctx.release().await?;
                removed += deleted?;
                store.branches().set_active(scope.id, false).await?;
            }
        }
    }
    info!(removed, "isolation self-check data cleaned up");
    Ok(removed)
}

async fn ensure_scope<K: ScopeKind>(catalog: &Catalog<K>, slug: &str, name: &str) -> Result<Scope<K>> {
    match catalog.find_by_slug(slug).await? {
        Some(scope) if scope.active => Ok(scope),
        Some(scope) => catalog.set_active(scope.id, true).await,
        None => catalog.create(NewScope::new(name, slug)).await,
    }
}

async fn seed_products(store: &Store, tenant: i32, names: &[&str]) -> Result<()> {
    let mut ctx = store.bind_scope::<Tenant>(tenant).await?;
    let seeded = async {
        let conn = ctx.conn()?;
        Products.delete_visible(conn).await?;
        for (n, name) in names.iter().enumerate() {
            Products
                .create(conn, NewProduct::new(*name, 1000 * (n as i64 + 1)))
                .await?;
        }
        Ok::<_, crate::Error>(())
    }
    .await;
    ctx.release().await?;
    seeded
}

async fn visible_products(store: &Store, tenant: i32) -> Result<i64> {
    let mut ctx = store.bind_scope::<Tenant>(tenant).await?;
    let count = Products.count(ctx.conn()?).await;
    ctx.release().await?;
    count
}

/// Rows visible under settings that are not valid tenant keys. The caller
/// clears the connection afterwards.
async fn malformed_settings_visibility(conn: &mut sqlx::PgConnection) -> Result<i64> {
    let mut seen = 0;
    for raw in ["abc", "0", "-1", "99999999999", "1; drop table products", " 1"] {
        sqlx::query("select set_config($1, $2, false)")
            .bind(Tenant::SETTING)
            .bind(raw)
            .execute(&mut *conn)
            .await?;
        seen += Products.count(conn).await?;
    }
    Ok(seen)
}

async fn row_security_state(store: &Store, table: ProtectedTable) -> Result<(bool, bool, bool)> {
    let (enabled, forced): (bool, bool) = sqlx::query_as(
        "select c.relrowsecurity, c.relforcerowsecurity from pg_class c \
         join pg_namespace n on n.oid = c.relnamespace \
         where c.relname = $1 and n.nspname = current_schema()",
    )
    .bind(table.table_name())
    .fetch_one(store.pool())
    .await?;
    let prefix = table.policy(DEFAULT_POLICY_VERSION).name_prefix();
    let policy: bool = sqlx::query_scalar(
        "select exists (select 1 from pg_policies where tablename = $1 and policyname like $2 || '%')",
    )
    .bind(table.table_name())
    .bind(prefix)
    .fetch_one(store.pool())
    .await?;
    Ok((enabled, forced, policy))
}
