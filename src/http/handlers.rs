use axum::{
    Extension, Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    binder::{CLEARED, ContextBinder},
    catalog::Catalog,
    http::{
        AppState,
        error::ApiResult,
        middleware::RequestScope,
    },
    metrics,
    protected::{NewProduct, Products, Sales},
    scope::{Branch, ScopeKind, Tenant},
};

const DEFAULT_PAGE: i64 = 100;

#[derive(Debug, Default, Deserialize)]
pub struct Page {
    pub limit: Option<i64>,
}

impl Page {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, 1000)
    }
}

pub async fn healthz(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let health = state.store.pool_health().await?;
    Ok(Json(json!({ "ok": health.ok })))
}

pub async fn metrics_text() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_prometheus(),
    )
}

/// What the connection serving this request is bound to, read back from
/// the database rather than from request state.
pub async fn context_status<K: ScopeKind>(
    Extension(scope): Extension<RequestScope<K>>,
) -> ApiResult<Json<Value>> {
    let mut ctx = scope.lock().await;
    let raw = ContextBinder::<K>::current(ctx.conn()?).await?;
    let bound = raw.as_deref().is_some_and(|v| v != CLEARED);
    Ok(Json(json!({
        "kind": K::NAME,
        "setting": K::SETTING,
        "bound": bound,
        "value": raw.filter(|v| v != CLEARED),
        "state": ctx.state().as_str(),
        "scope": ctx.scope(),
    })))
}

pub async fn list_products(
    Extension(scope): Extension<RequestScope<Tenant>>,
) -> ApiResult<Json<Value>> {
    let mut ctx = scope.lock().await;
    let products = Products.list(ctx.conn()?).await?;
    Ok(Json(json!({
        "tenant": ctx.scope(),
        "count": products.len(),
        "products": products,
    })))
}

pub async fn create_product(
    Extension(scope): Extension<RequestScope<Tenant>>,
    Json(new): Json<NewProduct>,
) -> ApiResult<impl IntoResponse> {
    let mut ctx = scope.lock().await;
    let product = Products.create(ctx.conn()?, new).await?;
    Ok((StatusCode::CREATED, Json(json!({ "product": product }))))
}

pub async fn list_branches(
    Extension(scope): Extension<RequestScope<Branch>>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let mut ctx = scope.lock().await;
    let branches = Catalog::<Branch>::list_active_on(ctx.conn()?, page.limit()).await?;
    Ok(Json(json!({
        "count": branches.len(),
        "branches": branches,
    })))
}

pub async fn list_sales(
    Extension(scope): Extension<RequestScope<Branch>>,
    Query(page): Query<Page>,
) -> ApiResult<Json<Value>> {
    let mut ctx = scope.lock().await;
    let sales = Sales.list(ctx.conn()?, page.limit()).await?;
    Ok(Json(json!({
        "branch": ctx.scope(),
        "count": sales.len(),
        "sales": sales,
    })))
}

pub async fn sales_summary(
    Extension(scope): Extension<RequestScope<Branch>>,
) -> ApiResult<Json<Value>> {
    let mut ctx = scope.lock().await;
    let summary = Sales.summary(ctx.conn()?).await?;
    Ok(Json(json!({
        "branch": ctx.scope(),
        "summary": summary,
    })))
}
