use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::{Body, to_bytes},
    extract::{Query, Request, State},
    http::{HeaderMap, Method, header, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::{
    Error, Result,
    binder::BoundContext,
    context::{Principal, RequestParts},
    http::{AppState, error::ApiError},
    scope::ScopeKind,
};

pub const PRINCIPAL_HEADER: &str = "x-principal";
pub const PRINCIPAL_SCOPE_HEADER: &str = "x-principal-scope";
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// The request's bound context, shared with handlers.
pub struct RequestScope<K: ScopeKind>(Arc<Mutex<BoundContext<K>>>);

impl<K: ScopeKind> Clone for RequestScope<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K: ScopeKind> RequestScope<K> {
    fn new(ctx: BoundContext<K>) -> Self {
        Self(Arc::new(Mutex::new(ctx)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, BoundContext<K>> {
        self.0.lock().await
    }

    async fn release(&self) -> Result<()> {
        self.0.lock().await.release().await
    }

    async fn abandon(&self) {
        self.0.lock().await.abandon();
    }
}

pub async fn scope_layer<K: ScopeKind>(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let policy = state.route_policy(parts.uri.path());

    let (json, body) = if is_json_write(&parts) {
        match to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => (serde_json::from_slice::<Value>(&bytes).ok(), Body::from(bytes)),
            Err(_) => {
                return ApiError(Error::InvalidInput("request body could not be read".into()))
                    .into_response();
            }
        }
    } else {
        (None, body)
    };

    let snapshot = snapshot::<K>(&parts, json);
    let ctx = match state.store.begin::<K>(&snapshot, policy).await {
        Ok(ctx) => ctx,
        Err(err) => return ApiError(err).into_response(),
    };

    let scope = RequestScope::new(ctx);
    let mut request = Request::from_parts(parts, body);
    request.extensions_mut().insert(scope.clone());

    let response = match state.store.request_timeout() {
        Some(limit) => match tokio::time::timeout(limit, next.run(request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(target: "rowguard::gate", kind = K::NAME, "request timed out");
                scope.abandon().await;
                return ApiError(Error::Timeout(limit)).into_response();
            }
        },
        None => next.run(request).await,
    };

    match scope.release().await {
        Ok(()) => response,
        Err(err) => ApiError(err).into_response(),
    }
}

fn is_json_write(parts: &Parts) -> bool {
    let write = matches!(parts.method, Method::POST | Method::PUT | Method::PATCH);
    let json = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"));
    write && json
}

/// Copies what identity extraction needs out of the request.
fn snapshot<K: ScopeKind>(parts: &Parts, body: Option<Value>) -> RequestParts {
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(q)| q)
        .unwrap_or_default();

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.host().map(str::to_string));

    let mut builder = RequestParts::builder()
        .method(parts.method.clone())
        .path(parts.uri.path())
        .headers(parts.headers.clone())
        .query_map(query)
        .principal(principal(&parts.headers));
    if let Some(body) = body {
        builder = builder.body(body);
    }
    if let Some(host) = host {
        builder = builder.host(host);
    }
    if let Some(value) = session_cookie(&parts.headers, &session_cookie_name::<K>()) {
        builder = builder.session_value(value);
    }
    builder.build()
}

/// Identity asserted by an upstream authenticator.
fn principal(headers: &HeaderMap) -> Principal {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    match (read(PRINCIPAL_HEADER), read(PRINCIPAL_SCOPE_HEADER)) {
        (Some(subject), Some(scope)) => Principal::affiliated(subject, scope),
        (Some(subject), None) => Principal::authenticated(subject),
        _ => Principal::Anonymous,
    }
}

pub fn session_cookie_name<K: ScopeKind>() -> String {
    format!("rowguard_{}", K::NAME)
}

fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
}
