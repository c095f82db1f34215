use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgExecutor, PgPool};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    Error, Result,
    schema::quote_ident,
    scope::{NewScope, Scope, ScopeKind, ScopeRow},
    validator::ScopeLookup,
};

pub struct Catalog<K: ScopeKind> {
    pool: PgPool,
    _kind: PhantomData<K>,
}

impl<K: ScopeKind> Clone for Catalog<K> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[derive(Debug, Serialize)]
pub struct Member<K: ScopeKind> {
    pub id: i64,
    pub scope_id: K::Id,
    pub username: String,
    pub email: Option<String>,
    pub active: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewMember {
    pub username: String,
    pub email: Option<String>,
}

impl NewMember {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: None,
        }
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct CatalogStats<K: ScopeKind> {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
    pub members: i64,
    pub recent: Vec<Scope<K>>,
}

impl<K: ScopeKind> Catalog<K> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _kind: PhantomData,
        }
    }

    fn table() -> String {
        quote_ident(K::CATALOG_TABLE)
    }

    fn select_list() -> String {
        format!(
            "id, name, {} as slug, description, is_active, created_at",
            quote_ident(K::SLUG_COLUMN)
        )
    }

    /// Creates a scope after checking slug format and uniqueness.
    pub async fn create(&self, new: NewScope) -> Result<Scope<K>> {
        new.validate()?;
        if self.find_by_slug(&new.slug).await?.is_some() {
            return Err(Error::DuplicateSlug(new.slug));
        }

        let sql = format!(
            "insert into {table} (name, {slug}, description, is_active) values ($1, $2, $3, $4) returning {cols}",
            table = Self::table(),
            slug = quote_ident(K::SLUG_COLUMN),
            cols = Self::select_list(),
        );
        let row: ScopeRow<K::Id> = sqlx::query_as(&sql)
            .bind(new.name.trim())
            .bind(&new.slug)
            .bind(&new.description)
            .bind(new.active)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Error::DuplicateSlug(new.slug.clone())
                }
                _ => Error::Db(e),
            })?;
        let scope = Scope::from_row(row);
        info!(kind = K::NAME, id = %scope.id, slug = %scope.slug, "scope created");
        Ok(scope)
    }

    pub async fn get(&self, id: K::Id) -> Result<Option<Scope<K>>> {
        Self::fetch_by_id(&self.pool, id).await
    }

    pub async fn find_by_slug(&self, slug: &str) -> Result<Option<Scope<K>>> {
        Self::fetch_by_slug(&self.pool, slug).await
    }

    async fn fetch_by_id<'e, E: PgExecutor<'e>>(executor: E, id: K::Id) -> Result<Option<Scope<K>>> {
        let sql = format!(
            "select {cols} from {table} where id = $1",
            cols = Self::select_list(),
            table = Self::table(),
        );
        let row: Option<ScopeRow<K::Id>> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(Scope::from_row))
    }

    async fn fetch_by_slug<'e, E: PgExecutor<'e>>(
        executor: E,
        slug: &str,
    ) -> Result<Option<Scope<K>>> {
        let sql = format!(
            "select {cols} from {table} where {slug} = $1",
            cols = Self::select_list(),
            table = Self::table(),
            slug = quote_ident(K::SLUG_COLUMN),
        );
        let row: Option<ScopeRow<K::Id>> = sqlx::query_as(&sql)
            .bind(slug)
            .fetch_optional(executor)
            .await?;
        Ok(row.map(Scope::from_row))
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<Scope<K>>> {
        self.list_filtered(limit, false).await
    }

    pub async fn list_active(&self, limit: i64) -> Result<Vec<Scope<K>>> {
        self.list_filtered(limit, true).await
    }

    /// Active scopes read on a connection the caller already holds.
    pub async fn list_active_on(conn: &mut PgConnection, limit: i64) -> Result<Vec<Scope<K>>> {
        Self::fetch_list(&mut *conn, limit, true).await
    }

    async fn list_filtered(&self, limit: i64, only_active: bool) -> Result<Vec<Scope<K>>> {
        Self::fetch_list(&self.pool, limit, only_active).await
    }

    async fn fetch_list<'e, E: PgExecutor<'e>>(
        executor: E,
        limit: i64,
        only_active: bool,
    ) -> Result<Vec<Scope<K>>> {
        let sql = format!(
            "select {cols} from {table} {filter} order by created_at, name limit $1",
            cols = Self::select_list(),
            table = Self::table(),
            filter = if only_active { "where is_active" } else { "" },
        );
        let rows: Vec<ScopeRow<K::Id>> = sqlx::query_as(&sql)
            .bind(limit.max(0))
            .fetch_all(executor)
            .await?;
        Ok(rows.into_iter().map(Scope::from_row).collect())
    }

    /// Flips the activation flag. Protected rows of the scope are untouched;
    /// deactivation only blocks new bindings and writes.
    pub async fn set_active(&self, id: K::Id, active: bool) -> Result<Scope<K>> {
        let sql = format!(
            "update {table} set is_active = $2 where id = $1 returning {cols}",
            table = Self::table(),
            cols = Self::select_list(),
        );
        let row: Option<ScopeRow<K::Id>> = sqlx::query_as(&sql)
            .bind(id)
            .bind(active)
            .fetch_optional(&self.pool)
            .await?;
        let scope = row.map(Scope::from_row).ok_or_else(|| Error::ScopeNotFound {
            kind: K::NAME,
            id: id.to_string(),
        })?;
        info!(kind = K::NAME, id = %scope.id, active, "scope activation changed");
        Ok(scope)
    }

    /// Fails unless the scope exists and is active.
    pub async fn require_active(&self, id: K::Id) -> Result<Scope<K>> {
        match self.get(id).await? {
            Some(scope) if scope.active => Ok(scope),
            _ => Err(Error::UnknownOrInactiveScope {
                kind: K::NAME,
                value: id.to_string(),
            }),
        }
    }

    /// Activation check on a connection the caller already holds.
    pub async fn is_active_on(conn: &mut PgConnection, id: K::Id) -> Result<bool> {
        Ok(Self::fetch_by_id(&mut *conn, id)
            .await?
            .is_some_and(|scope| scope.active))
    }

    pub async fn add_member(&self, scope_id: K::Id, new: NewMember) -> Result<Member<K>> {
        let username = new.username.trim();
        if username.is_empty() {
            return Err(Error::InvalidInput("username must not be empty".into()));
        }
        self.require_active(scope_id).await?;

        let sql = format!(
            "insert into {table} ({column}, username, email) values ($1, $2, $3) \
             returning id, {column}, username, email, is_active, joined_at",
            table = quote_ident(K::MEMBER_TABLE),
            column = quote_ident(K::COLUMN),
        );
        let row: MemberRow<K::Id> = sqlx::query_as(&sql)
            .bind(scope_id)
            .bind(username)
            .bind(&new.email)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateRecord {
                    what: "member",
                    key: username.to_string(),
                },
                _ => Error::Db(e),
            })?;
        Ok(member_from_row(row))
    }

    pub async fn members(&self, scope_id: K::Id, limit: i64) -> Result<Vec<Member<K>>> {
        if self.get(scope_id).await?.is_none() {
            return Err(Error::ScopeNotFound {
                kind: K::NAME,
                id: scope_id.to_string(),
            });
        }
        let sql = format!(
            "select id, {column}, username, email, is_active, joined_at from {table} \
             where {column} = $1 order by id limit $2",
            table = quote_ident(K::MEMBER_TABLE),
            column = quote_ident(K::COLUMN),
        );
        let rows: Vec<MemberRow<K::Id>> = sqlx::query_as(&sql)
            .bind(scope_id)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(member_from_row).collect())
    }

    pub async fn stats(&self) -> Result<CatalogStats<K>> {
        let sql = format!(
            "select count(*), count(*) filter (where is_active) from {table}",
            table = Self::table(),
        );
        let (total, active): (i64, i64) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        let members: i64 = sqlx::query_scalar(&format!(
            "select count(*) from {}",
            quote_ident(K::MEMBER_TABLE)
        ))
        .fetch_one(&self.pool)
        .await?;

        let recent_sql = format!(
            "select {cols} from {table} order by created_at desc, id desc limit 5",
            cols = Self::select_list(),
            table = Self::table(),
        );
        let recent: Vec<ScopeRow<K::Id>> = sqlx::query_as(&recent_sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(CatalogStats {
            total,
            active,
            inactive: total - active,
            members,
            recent: recent.into_iter().map(Scope::from_row).collect(),
        })
    }
}

type MemberRow<I> = (i64, I, String, Option<String>, bool, DateTime<Utc>);

fn member_from_row<K: ScopeKind>(row: MemberRow<K::Id>) -> Member<K> {
    let (id, scope_id, username, email, active, joined_at) = row;
    Member {
        id,
        scope_id,
        username,
        email,
        active,
        joined_at,
    }
}

#[async_trait]
impl<K: ScopeKind> ScopeLookup<K> for Catalog<K> {
    async fn find_by_id(&self, id: K::Id) -> Result<Option<Scope<K>>> {
        self.get(id).await
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Scope<K>>> {
        Catalog::find_by_slug(self, slug).await
    }
}

/// Catalog lookups that run on a connection already checked out for a
/// request. Resolution then never needs a second pooled connection.
pub struct ConnLookup<'a, K: ScopeKind> {
    conn: Mutex<&'a mut PgConnection>,
    _kind: PhantomData<K>,
}

impl<'a, K: ScopeKind> ConnLookup<'a, K> {
    pub fn new(conn: &'a mut PgConnection) -> Self {
        Self {
            conn: Mutex::new(conn),
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<'a, K: ScopeKind> ScopeLookup<K> for ConnLookup<'a, K> {
    async fn find_by_id(&self, id: K::Id) -> Result<Option<Scope<K>>> {
        let mut conn = self.conn.lock().await;
        Catalog::<K>::fetch_by_id(&mut **conn, id).await
    }

    async fn find_by_slug(&self, slug: &str) -> Result<Option<Scope<K>>> {
        let mut conn = self.conn.lock().await;
        Catalog::<K>::fetch_by_slug(&mut **conn, slug).await
    }
}
