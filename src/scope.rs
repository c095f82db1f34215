use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Postgres;
use uuid::Uuid;

use crate::{Error, Result};

pub const SLUG_MIN_LEN: usize = 3;
pub const SLUG_MAX_LEN: usize = 50;
pub const NAME_MAX_LEN: usize = 100;

/// Native key of a scope catalog.
pub trait ScopeKey:
    Copy
    + Eq
    + Hash
    + fmt::Debug
    + fmt::Display
    + Serialize
    + Send
    + Sync
    + Unpin
    + 'static
    + sqlx::Type<Postgres>
    + for<'q> sqlx::Encode<'q, Postgres>
    + for<'r> sqlx::Decode<'r, Postgres>
{
}

impl<T> ScopeKey for T where
    T: Copy
        + Eq
        + Hash
        + fmt::Debug
        + fmt::Display
        + Serialize
        + Send
        + Sync
        + Unpin
        + 'static
        + sqlx::Type<Postgres>
        + for<'q> sqlx::Encode<'q, Postgres>
        + for<'r> sqlx::Decode<'r, Postgres>
{
}

pub trait ScopeKind: Send + Sync + 'static {
    type Id: ScopeKey;

    /// Human label used in errors and logs.
    const NAME: &'static str;
    /// Session setting read by the row policies.
    const SETTING: &'static str;
    const CATALOG_TABLE: &'static str;
    const SLUG_COLUMN: &'static str;
    const MEMBER_TABLE: &'static str;
    /// Scope column on protected and member tables.
    const COLUMN: &'static str;
    const HEADER: &'static str;
    /// Query parameter and JSON body field.
    const PARAM: &'static str;
    const KEY_SQL_TYPE: &'static str;

    fn parse_id(raw: &str) -> Result<Self::Id>;

    fn is_valid_id(_id: &Self::Id) -> bool {
        true
    }

    /// SQL expression yielding the bound key, or NULL when the setting is
    /// unset, empty or not a well-formed key. Never raises.
    fn policy_key_expr() -> String;

    /// Extra predicate on the protected column, if any.
    fn column_guard(_column: &str) -> Option<String> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Tenant;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Branch;

impl ScopeKind for Tenant {
    type Id = i32;

    const NAME: &'static str = "tenant";
    const SETTING: &'static str = "app.current_tenant";
    const CATALOG_TABLE: &'static str = "tenants";
    const SLUG_COLUMN: &'static str = "subdomain";
    const MEMBER_TABLE: &'static str = "tenant_members";
    const COLUMN: &'static str = "tenant_id";
    const HEADER: &'static str = "x-tenant-id";
    const PARAM: &'static str = "tenant_id";
    const KEY_SQL_TYPE: &'static str = "integer";

    fn parse_id(raw: &str) -> Result<i32> {
        let trimmed = raw.trim();
        match trimmed.parse::<i32>() {
            Ok(id) if id > 0 && !trimmed.starts_with('+') => Ok(id),
            _ => Err(Error::MalformedIdentity {
                kind: Self::NAME,
                value: raw.to_string(),
            }),
        }
    }

    fn is_valid_id(id: &i32) -> bool {
        *id > 0
    }

    fn policy_key_expr() -> String {
        let setting = current_setting(Self::SETTING);
        format!(
            "case when {setting} ~ '^[1-9][0-9]{{0,9}}$' then \
             case when ({setting})::bigint <= 2147483647 then ({setting})::integer end end"
        )
    }

    fn column_guard(column: &str) -> Option<String> {
        Some(format!("{column} > 0"))
    }
}

impl ScopeKind for Branch {
    type Id = Uuid;

    const NAME: &'static str = "branch";
    const SETTING: &'static str = "app.current_branch_id";
    const CATALOG_TABLE: &'static str = "branches";
    const SLUG_COLUMN: &'static str = "code";
    const MEMBER_TABLE: &'static str = "branch_members";
    const COLUMN: &'static str = "branch_id";
    const HEADER: &'static str = "x-branch-id";
    const PARAM: &'static str = "branch_id";
    const KEY_SQL_TYPE: &'static str = "uuid";

    fn parse_id(raw: &str) -> Result<Uuid> {
        Uuid::parse_str(raw.trim()).map_err(|_| Error::MalformedIdentity {
            kind: Self::NAME,
            value: raw.to_string(),
        })
    }

    fn is_valid_id(id: &Uuid) -> bool {
        !id.is_nil()
    }

    fn policy_key_expr() -> String {
        let setting = current_setting(Self::SETTING);
        format!(
            "case when {setting} ~* '^[0-9a-f]{{8}}-[0-9a-f]{{4}}-[0-9a-f]{{4}}-[0-9a-f]{{4}}-[0-9a-f]{{12}}$' \
             then ({setting})::uuid end"
        )
    }
}

/// Every isolation setting a pooled connection may carry.
pub const ISOLATION_SETTINGS: [&str; 2] = [Tenant::SETTING, Branch::SETTING];

fn current_setting(name: &str) -> String {
    format!("current_setting('{name}', true)")
}

/// A row of a scope catalog.
#[derive(Debug, Serialize)]
pub struct Scope<K: ScopeKind> {
    pub id: K::Id,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    _kind: PhantomData<K>,
}

impl<K: ScopeKind> Clone for Scope<K> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            slug: self.slug.clone(),
            description: self.description.clone(),
            active: self.active,
            created_at: self.created_at,
            _kind: PhantomData,
        }
    }
}

pub(crate) type ScopeRow<I> = (I, String, String, Option<String>, bool, DateTime<Utc>);

impl<K: ScopeKind> Scope<K> {
    pub fn new(
        id: K::Id,
        name: impl Into<String>,
        slug: impl Into<String>,
        active: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            slug: slug.into(),
            description: None,
            active,
            created_at: Utc::now(),
            _kind: PhantomData,
        }
    }

    pub(crate) fn from_row(row: ScopeRow<K::Id>) -> Self {
        let (id, name, slug, description, active, created_at) = row;
        Self {
            id,
            name,
            slug,
            description,
            active,
            created_at,
            _kind: PhantomData,
        }
    }
}

/// Input for creating a catalog entry.
#[derive(Clone, Debug)]
pub struct NewScope {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub active: bool,
}

impl NewScope {
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: None,
            active: true,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("scope name must not be empty".into()));
        }
        if name.chars().count() > NAME_MAX_LEN {
            return Err(Error::InvalidInput(format!(
                "scope name exceeds {NAME_MAX_LEN} characters"
            )));
        }
        validate_slug(&self.slug)
    }
}

/// Slugs are lowercase ASCII letters, digits and inner hyphens.
pub fn validate_slug(slug: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidSlug {
            slug: slug.to_string(),
            reason,
        })
    };
    if slug.len() < SLUG_MIN_LEN {
        return invalid("must be at least 3 characters");
    }
    if slug.len() > SLUG_MAX_LEN {
        return invalid("must be at most 50 characters");
    }
    if !slug
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
    {
        return invalid("only lowercase letters, digits and hyphens are allowed");
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return invalid("must not start or end with a hyphen");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_ids_are_strictly_positive_integers() {
        assert_eq!(Tenant::parse_id("42").unwrap(), 42);
        assert_eq!(Tenant::parse_id(" 7 ").unwrap(), 7);
        for bad in ["abc", "0", "-3", "", "1.5", "+4", "99999999999"] {
            assert!(
                matches!(
                    Tenant::parse_id(bad),
                    Err(Error::MalformedIdentity { kind: "tenant", .. })
                ),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn branch_ids_are_uuids() {
        let id = Uuid::new_v4();
        assert_eq!(Branch::parse_id(&id.to_string()).unwrap(), id);
        assert!(matches!(
            Branch::parse_id("not-a-uuid"),
            Err(Error::MalformedIdentity { kind: "branch", .. })
        ));
        assert!(!Branch::is_valid_id(&Uuid::nil()));
    }

    #[test]
    fn slug_rules() {
        assert!(validate_slug("acme-01").is_ok());
        assert!(validate_slug("abc").is_ok());
        assert!(validate_slug("ab").is_err());
        assert!(validate_slug("Acme").is_err());
        assert!(validate_slug("acme_01").is_err());
        assert!(validate_slug("-acme").is_err());
        assert!(validate_slug("acme-").is_err());
        assert!(validate_slug(&"a".repeat(51)).is_err());
    }

    #[test]
    fn new_scope_rejects_blank_names() {
        assert!(NewScope::new("  ", "acme").validate().is_err());
        assert!(NewScope::new("Acme", "acme").validate().is_ok());
    }

    #[test]
    fn policy_expressions_read_their_own_setting() {
        assert!(Tenant::policy_key_expr().contains("current_setting('app.current_tenant', true)"));
        assert!(Tenant::policy_key_expr().contains("::integer"));
        assert!(
            Branch::policy_key_expr().contains("current_setting('app.current_branch_id', true)")
        );
        assert!(Branch::policy_key_expr().contains("::uuid"));
    }
}
