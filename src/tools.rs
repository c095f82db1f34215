use serde_json::{Value, json};
use tracing::{error, info};

use crate::{
    Error, Result,
    catalog::{Catalog, NewMember},
    scope::{NewScope, ScopeKind},
};

pub const DEFAULT_SCOPE_LIMIT: i64 = 10;
pub const DEFAULT_MEMBER_LIMIT: i64 = 20;

pub struct CatalogTools<K: ScopeKind> {
    catalog: Catalog<K>,
}

impl<K: ScopeKind> CatalogTools<K> {
    pub fn new(catalog: Catalog<K>) -> Self {
        Self { catalog }
    }

    pub async fn list_scopes(&self, limit: i64) -> Value {
        respond("list_scopes", async {
            let scopes = self.catalog.list(limit).await?;
            Ok(json!({
                "success": true,
                "kind": K::NAME,
                "count": scopes.len(),
                "scopes": scopes,
            }))
        })
        .await
    }

    pub async fn get_scope(&self, raw_id: &str) -> Value {
        respond("get_scope", async {
            let id = K::parse_id(raw_id)?;
            let scope = self.catalog.get(id).await?.ok_or_else(|| Error::ScopeNotFound {
                kind: K::NAME,
                id: id.to_string(),
            })?;
            Ok(json!({ "success": true, "scope": scope }))
        })
        .await
    }

    pub async fn list_scope_members(&self, raw_id: &str, limit: i64) -> Value {
        respond("list_scope_members", async {
            let id = K::parse_id(raw_id)?;
            let scope = self.catalog.get(id).await?.ok_or_else(|| Error::ScopeNotFound {
                kind: K::NAME,
                id: id.to_string(),
            })?;
            let members = self.catalog.members(id, limit).await?;
            Ok(json!({
                "success": true,
                "scope": { "id": scope.id, "name": scope.name },
                "count": members.len(),
                "members": members,
            }))
        })
        .await
    }

    pub async fn create_scope(&self, name: &str, slug: &str, description: Option<&str>) -> Value {
        respond("create_scope", async {
            let mut new = NewScope::new(name, slug);
            if let Some(text) = description.map(str::trim).filter(|d| !d.is_empty()) {
                new = new.description(text);
            }
            let scope = self.catalog.create(new).await?;
            Ok(json!({
                "success": true,
                "message": format!("created {} `{}`", K::NAME, scope.name),
                "scope": scope,
            }))
        })
        .await
    }

    pub async fn add_scope_member(&self, raw_id: &str, username: &str, email: Option<&str>) -> Value {
        respond("add_scope_member", async {
            let id = K::parse_id(raw_id)?;
            let mut new = NewMember::new(username);
            if let Some(email) = email {
                new = new.email(email);
            }
            let member = self.catalog.add_member(id, new).await?;
            Ok(json!({ "success": true, "member": member }))
        })
        .await
    }

    pub async fn set_scope_active(&self, raw_id: &str, active: bool) -> Value {
        respond("set_scope_active", async {
            let id = K::parse_id(raw_id)?;
            let scope = self.catalog.set_active(id, active).await?;
            Ok(json!({ "success": true, "scope": scope }))
        })
        .await
    }

    pub async fn scope_stats(&self) -> Value {
        respond("scope_stats", async {
            let stats = self.catalog.stats().await?;
            Ok(json!({
                "success": true,
                "kind": K::NAME,
                "stats": {
                    "total": stats.total,
                    "active": stats.active,
                    "inactive": stats.inactive,
                    "members": stats.members,
                },
                "recent": stats.recent,
            }))
        })
        .await
    }
}

async fn respond(tool: &'static str, body: impl Future<Output = Result<Value>>) -> Value {
    match body.await {
        Ok(value) => {
            info!(tool, "tool call succeeded");
            value
        }
        Err(err) => failure(tool, &err),
    }
}

fn failure(tool: &'static str, err: &Error) -> Value {
    let kind = err.kind();
    let message = if kind.is_internal() {
        error!(tool, error = %err, "tool call failed");
        "internal error".to_string()
    } else {
        info!(tool, code = kind.code(), error = %err, "tool call rejected");
        err.to_string()
    };
    json!({ "success": false, "code": kind.code(), "error": message })
}
