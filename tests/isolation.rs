mod common;

use anyhow::Result;
use rowguard::{
    Branch, ContextState, Error, NewScope, RequestParts, RoutePolicy, ScopeKind, Store, Tenant,
    binder::{CLEARED, ContextBinder},
    protected::{NewProduct, NewSale, Products, Sales},
};
use sqlx::PgPool;
use uuid::Uuid;

async fn seed(store: &Store, tenant: i32, names: &[&str]) -> Result<()> {
    let mut ctx = store.bind_scope::<Tenant>(tenant).await?;
    for name in names {
        Products
            .create(ctx.conn()?, NewProduct::new(*name, 1_000))
            .await?;
    }
    ctx.release().await?;
    Ok(())
}

fn unscoped() -> RequestParts {
    RequestParts::default()
}

#[tokio::test]
async fn tenants_only_see_their_own_rows() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;

    let t1 = store.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;
    let t2 = store.tenants().create(NewScope::new("Tenant Two", "tenant-two")).await?;
    seed(&store, t1.id, &["Product A", "Product B"]).await?;
    seed(&store, t2.id, &["Product C"]).await?;

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    assert_eq!(Products.count(ctx.conn()?).await?, 2);
    assert_eq!(Products.count_for(ctx.conn()?, t2.id).await?, 0);
    let names: Vec<String> = Products
        .list(ctx.conn()?)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, ["Product A", "Product B"]);
    ctx.release().await?;

    let mut ctx = store.bind_scope::<Tenant>(t2.id).await?;
    assert_eq!(Products.count(ctx.conn()?).await?, 1);
    ctx.release().await?;

    // Switching on one connection takes effect immediately.
    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    let conn = ctx.conn()?;
    assert_eq!(Products.count(conn).await?, 2);
    ContextBinder::<Tenant>::bind(conn, t2.id).await?;
    assert_eq!(Products.count(conn).await?, 1);
    ContextBinder::<Tenant>::bind(conn, t1.id).await?;
    assert_eq!(Products.count(conn).await?, 2);
    ContextBinder::<Tenant>::clear(conn).await?;
    assert_eq!(Products.count(conn).await?, 0);
    ctx.release().await?;

    let admin = store.admin("test: cross-tenant total")?;
    assert_eq!(
        admin
            .count_all(rowguard::policy::ProtectedTable::Products)
            .await?,
        3
    );
    Ok(())
}

#[tokio::test]
async fn unbound_and_malformed_settings_fail_closed() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let t1 = store.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;
    seed(&store, t1.id, &["Product A"]).await?;

    let mut ctx = store
        .begin::<Tenant>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(ctx.state(), ContextState::Unbound);
    assert_eq!(Products.count(ctx.conn()?).await?, 0);

    let write = Products
        .create(ctx.conn()?, NewProduct::new("Orphan", 100))
        .await;
    assert!(matches!(write, Err(Error::MissingScope { .. })));

    for raw in ["abc", "0", "-5", "99999999999", "1 or 1=1"] {
        sqlx::query("select set_config($1, $2, false)")
            .bind(Tenant::SETTING)
            .bind(raw)
            .execute(&mut *ctx.conn()?)
            .await?;
        assert_eq!(Products.count(ctx.conn()?).await?, 0, "setting {raw:?}");
    }
    ctx.release().await?;
    Ok(())
}

#[tokio::test]
async fn reused_connection_carries_no_binding() -> Result<()> {
    let db = common::start().await?;
    let seeded = db.store().await?;
    let t1 = seeded.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;
    seed(&seeded, t1.id, &["Product A", "Product B"]).await?;

    let store = db.single_connection_store().await?;

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    assert_eq!(Products.count(ctx.conn()?).await?, 2);
    ctx.release().await?;
    assert_eq!(ctx.state(), ContextState::Cleared);

    let mut next = store
        .begin::<Tenant>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(
        ContextBinder::<Tenant>::current(next.conn()?).await?.as_deref(),
        Some(CLEARED)
    );
    assert_eq!(Products.count(next.conn()?).await?, 0);
    next.release().await?;

    // A guard dropped without release closes its connection; the pool opens a
    // fresh one that is equally unbound.
    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    assert_eq!(Products.count(ctx.conn()?).await?, 2);
    drop(ctx);

    let mut next = store
        .begin::<Tenant>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(Products.count(next.conn()?).await?, 0);
    next.release().await?;
    Ok(())
}

#[tokio::test]
async fn clearing_is_idempotent() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let t1 = store.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    let conn = ctx.conn()?;
    assert_eq!(
        ContextBinder::<Tenant>::bound_id(conn).await?,
        Some(t1.id)
    );
    ContextBinder::<Tenant>::clear(conn).await?;
    ContextBinder::<Tenant>::clear(conn).await?;
    assert_eq!(
        ContextBinder::<Tenant>::current(conn).await?.as_deref(),
        Some(CLEARED)
    );
    assert_eq!(ContextBinder::<Tenant>::bound_id(conn).await?, None);

    ctx.release().await?;
    ctx.release().await?;
    assert!(matches!(ctx.conn(), Err(Error::ContextReleased)));
    Ok(())
}

#[tokio::test]
async fn deactivated_scope_is_rejected_and_connection_left_clean() -> Result<()> {
    let db = common::start().await?;
    let seeded = db.store().await?;
    let t1 = seeded.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;
    seed(&seeded, t1.id, &["Product A"]).await?;
    seeded.tenants().set_active(t1.id, false).await?;

    let store = db.single_connection_store().await?;
    let parts = RequestParts::builder()
        .header("x-tenant-id", &t1.id.to_string())
        .build();
    let err = store
        .begin::<Tenant>(&parts, RoutePolicy::RequireScope)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownOrInactiveScope { .. }));

    let err = store.bind_scope::<Tenant>(t1.id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownOrInactiveScope { .. }));

    let mut next = store
        .begin::<Tenant>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(Products.count(next.conn()?).await?, 0);
    next.release().await?;
    Ok(())
}

#[tokio::test]
async fn branch_sales_fail_closed_when_unbound_or_malformed() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let north = store.branches().create(NewScope::new("North", "north")).await?;

    let mut ctx = store.bind_scope::<Branch>(north.id).await?;
    Sales
        .record(ctx.conn()?, NewSale::new("Coffee", 1, 450))
        .await?;
    assert_eq!(Sales.count(ctx.conn()?).await?, 1);
    ctx.release().await?;

    let mut ctx = store
        .begin::<Branch>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(ctx.state(), ContextState::Unbound);
    assert_eq!(Sales.count(ctx.conn()?).await?, 0);

    // Postgres would cast the braced and simple forms to the same uuid.
    let braced = north.id.braced().to_string();
    let simple = north.id.simple().to_string();
    let nil = Uuid::nil().to_string();
    for raw in ["abc", nil.as_str(), braced.as_str(), simple.as_str()] {
        sqlx::query("select set_config($1, $2, false)")
            .bind(Branch::SETTING)
            .bind(raw)
            .execute(&mut *ctx.conn()?)
            .await?;
        assert_eq!(Sales.count(ctx.conn()?).await?, 0, "setting {raw:?}");
    }
    ctx.release().await?;
    Ok(())
}

#[tokio::test]
async fn failed_clear_discards_the_connection() -> Result<()> {
    let db = common::start().await?;
    let store = Store::builder(&db.app_url).max_connections(2).build().await?;
    let t1 = store.tenants().create(NewScope::new("Tenant One", "tenant-one")).await?;
    let owner = PgPool::connect(&db.owner_url).await?;

    let mut ctx = store.bind_scope::<Tenant>(t1.id).await?;
    let pid: i32 = sqlx::query_scalar("select pg_backend_pid()")
        .fetch_one(&mut *ctx.conn()?)
        .await?;
    let terminated: bool = sqlx::query_scalar("select pg_terminate_backend($1)")
        .bind(pid)
        .fetch_one(&owner)
        .await?;
    assert!(terminated);

    let before = store.pool().size();
    let err = ctx.release().await.unwrap_err();
    assert!(matches!(err, Error::ClearFailure { .. }));
    assert_eq!(ctx.state(), ContextState::Cleared);
    assert!(matches!(ctx.conn(), Err(Error::ContextReleased)));
    assert_eq!(store.pool().size(), before - 1);

    let mut next = store
        .begin::<Tenant>(&unscoped(), RoutePolicy::Exempt)
        .await?;
    assert_eq!(Products.count(next.conn()?).await?, 0);
    next.release().await?;
    owner.close().await;
    Ok(())
}
