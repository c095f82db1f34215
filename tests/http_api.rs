mod common;

use anyhow::Result;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use rowguard::{
    Branch, Deployment, NewScope,
    http::{AppState, router},
    protected::{NewSale, Sales},
};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn call(app: &Router, request: Request<Body>) -> Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
    };
    Ok((status, body))
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn get_as(uri: &str, header: &str, value: &str) -> Request<Body> {
    Request::get(uri)
        .header(header, value)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn tenant_api_binds_each_request() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let acme = store.tenants().create(NewScope::new("Acme", "acme-01")).await?;
    let globex = store.tenants().create(NewScope::new("Globex", "globex")).await?;
    let app = router(AppState::new(store.clone()), Deployment::Tenant);

    let (status, body) = call(&app, get("/healthz")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = call(&app, get("/api/products/")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MISSING_SCOPE");

    let (status, body) = call(&app, get_as("/api/products/", "x-tenant-id", "abc")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MALFORMED_IDENTITY");

    let create = Request::post("/api/products/")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "tenant_id": acme.id, "name": "Widget", "price_cents": 1200 }).to_string(),
        ))
        .unwrap();
    let (status, body) = call(&app, create).await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["product"]["tenant_id"], acme.id);

    let acme_id = acme.id.to_string();
    let (status, body) = call(&app, get_as("/api/products/", "x-tenant-id", &acme_id)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["tenant"]["slug"], "acme-01");

    let (_, body) = call(
        &app,
        get(&format!("/api/products/?tenant_id={}", globex.id)),
    )
    .await?;
    assert_eq!(body["count"], 0);

    let (status, body) = call(&app, get("/api/context-status/")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["bound"], false);

    let (_, body) = call(&app, get_as("/api/context-status/", "x-tenant-id", &acme_id)).await?;
    assert_eq!(body["bound"], true);
    assert_eq!(body["value"], acme_id);

    store.tenants().set_active(acme.id, false).await?;
    let (status, body) = call(&app, get_as("/api/products/", "x-tenant-id", &acme_id)).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "UNKNOWN_OR_INACTIVE_SCOPE");

    let (status, body) = call(
        &app,
        Request::get("/api/products/")
            .header("x-tenant-id", globex.id.to_string())
            .header("x-principal", "alice")
            .header("x-principal-scope", acme_id.as_str())
            .body(Body::empty())
            .unwrap(),
    )
    .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "SCOPE_MISMATCH");

    let (status, body) = call(&app, get("/metrics")).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().is_some_and(|text| text.contains("rowguard_binds_total")));
    Ok(())
}

#[tokio::test]
async fn branch_api_reports_only_bound_sales() -> Result<()> {
    let db = common::start().await?;
    let store = db.store().await?;
    let north = store.branches().create(NewScope::new("North", "north")).await?;
    let south = store.branches().create(NewScope::new("South", "south")).await?;
    for (branch, amount) in [(north.id, 1_000), (south.id, 9_000)] {
        let mut ctx = store.bind_scope::<Branch>(branch).await?;
        Sales
            .record(ctx.conn()?, NewSale::new("Coffee", 1, amount))
            .await?;
        ctx.release().await?;
    }
    let app = router(AppState::new(store.clone()), Deployment::Branch);

    let north_id = north.id.to_string();
    let (status, body) = call(&app, get_as("/api/sales-summary/", "x-branch-id", &north_id)).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["revenue_cents"], 1_000);

    let (_, body) = call(&app, get_as("/api/sales/", "x-branch-id", &north_id)).await?;
    assert_eq!(body["count"], 1);

    let (_, body) = call(&app, get_as("/api/branches/?limit=5", "x-branch-id", &north_id)).await?;
    assert_eq!(body["count"], 2);

    let (status, body) = call(&app, get("/api/sales/")).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "MISSING_SCOPE");

    // Tenant routes are not mounted on a branch deployment.
    let (status, _) = call(&app, get_as("/api/products/", "x-branch-id", &north_id)).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    Ok(())
}
