use std::fmt;
use std::marker::PhantomData;

use sqlx::{PgConnection, PgPool, Postgres, pool::PoolConnection};
use tracing::{debug, error, warn};

use crate::{
    Error, Result, metrics,
    scope::{ISOLATION_SETTINGS, Scope, ScopeKind},
};

/// Value a cleared setting holds. Row policies map it to "no rows".
pub const CLEARED: &str = "";

pub struct ContextBinder<K: ScopeKind>(PhantomData<K>);

impl<K: ScopeKind> ContextBinder<K> {
    pub async fn bind(conn: &mut PgConnection, id: K::Id) -> Result<()> {
        if !K::is_valid_id(&id) {
            return Err(Error::BindingFailure {
                setting: K::SETTING,
                detail: format!("refusing to bind invalid {} id {id}", K::NAME),
            });
        }
        let wanted = id.to_string();
        let echoed: Option<String> = sqlx::query_scalar("select set_config($1, $2, false)")
            .bind(K::SETTING)
            .bind(&wanted)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::BindingFailure {
                setting: K::SETTING,
                detail: e.to_string(),
            })?;
        if echoed.as_deref() != Some(wanted.as_str()) {
            return Err(Error::BindingFailure {
                setting: K::SETTING,
                detail: format!("setting read back as {echoed:?}"),
            });
        }
        metrics::metrics().record_bind();
        Ok(())
    }

    /// Resets the setting to the sentinel. Clearing twice is a no-op.
    pub async fn clear(conn: &mut PgConnection) -> Result<()> {
        clear_setting(conn, K::SETTING).await
    }

    /// Raw value of the setting on this connection; `None` if never set.
    pub async fn current(conn: &mut PgConnection) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("select current_setting($1, true)")
            .bind(K::SETTING)
            .fetch_one(&mut *conn)
            .await?;
        Ok(value)
    }

    /// The bound key, if the setting holds a well-formed one.
    pub async fn bound_id(conn: &mut PgConnection) -> Result<Option<K::Id>> {
        Ok(Self::current(conn)
            .await?
            .filter(|raw| raw != CLEARED)
            .and_then(|raw| K::parse_id(&raw).ok()))
    }
}

async fn clear_setting(conn: &mut PgConnection, setting: &'static str) -> Result<()> {
    let echoed: Option<String> = sqlx::query_scalar("select set_config($1, $2, false)")
        .bind(setting)
        .bind(CLEARED)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| Error::ClearFailure {
            setting,
            detail: e.to_string(),
        })?;
    if echoed.as_deref() != Some(CLEARED) {
        return Err(Error::ClearFailure {
            setting,
            detail: format!("setting read back as {echoed:?}"),
        });
    }
    metrics::metrics().record_clear();
    Ok(())
}

/// Clears every isolation setting, whichever deployment bound it.
pub async fn clear_all(conn: &mut PgConnection) -> Result<()> {
    for setting in ISOLATION_SETTINGS {
        clear_setting(conn, setting).await?;
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextState {
    Unbound,
    Resolving,
    Bound,
    Rejected,
    Cleared,
}

impl ContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Unbound => "unbound",
            ContextState::Resolving => "resolving",
            ContextState::Bound => "bound",
            ContextState::Rejected => "rejected",
            ContextState::Cleared => "cleared",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exclusive checkout of one pooled connection for one request.
///
/// Call [`BoundContext::release`] when the request is done. Dropping the
/// guard without releasing it closes the connection rather than returning
/// it to the pool.
pub struct BoundContext<K: ScopeKind> {
    conn: Option<PoolConnection<Postgres>>,
    scope: Option<Scope<K>>,
    state: ContextState,
}

impl<K: ScopeKind> BoundContext<K> {
    /// Acquires a connection and clears any isolation setting it carries.
    pub(crate) async fn checkout(pool: &PgPool) -> Result<Self> {
        let mut conn = pool.acquire().await?;
        if let Err(err) = clear_all(&mut conn).await {
            error!(target: "rowguard::binder", error = %err, "clear on checkout failed; discarding connection");
            discard(conn);
            return Err(err);
        }
        Ok(Self {
            conn: Some(conn),
            scope: None,
            state: ContextState::Unbound,
        })
    }

    pub(crate) fn resolving(&mut self) {
        self.state = ContextState::Resolving;
    }

    pub(crate) fn unbound(&mut self) {
        self.state = ContextState::Unbound;
    }

    pub(crate) fn rejected(&mut self) {
        self.state = ContextState::Rejected;
    }

    pub(crate) async fn bind(&mut self, scope: Scope<K>) -> Result<()> {
        let conn = self.conn.as_deref_mut().ok_or(Error::ContextReleased)?;
        match ContextBinder::<K>::bind(conn, scope.id).await {
            Ok(()) => {
                debug!(target: "rowguard::binder", kind = K::NAME, id = %scope.id, "scope bound");
                self.scope = Some(scope);
                self.state = ContextState::Bound;
                Ok(())
            }
            Err(err) => {
                error!(target: "rowguard::binder", kind = K::NAME, error = %err, "bind failed; discarding connection");
                if let Some(conn) = self.conn.take() {
                    discard(conn);
                }
                self.state = ContextState::Rejected;
                Err(err)
            }
        }
    }

    pub fn scope(&self) -> Option<&Scope<K>> {
        self.scope.as_ref()
    }

    pub fn id(&self) -> Option<K::Id> {
        self.scope.as_ref().map(|s| s.id)
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.state == ContextState::Bound
    }

    /// The checked-out connection. Queries on protected tables run here.
    pub fn conn(&mut self) -> Result<&mut PgConnection> {
        self.conn.as_deref_mut().ok_or(Error::ContextReleased)
    }

    /// Closes the connection without attempting a clear. Used when the
    /// connection may be mid-statement, e.g. after a timeout.
    pub(crate) fn abandon(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(target: "rowguard::binder", kind = K::NAME, state = %self.state, "abandoning connection");
            discard(conn);
        }
        self.scope = None;
        self.state = ContextState::Cleared;
    }

    /// Clears the binding and returns the connection to the pool.
    ///
    /// A failed clear closes the connection and reports `ClearFailure`.
    /// Releasing an already released context does nothing.
    pub async fn release(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        self.scope = None;
        match ContextBinder::<K>::clear(&mut conn).await {
            Ok(()) => {
                self.state = ContextState::Cleared;
                Ok(())
            }
            Err(err) => {
                error!(target: "rowguard::binder", kind = K::NAME, error = %err, "clear failed; discarding connection");
                metrics::metrics().record_clear_failure();
                discard(conn);
                self.state = ContextState::Cleared;
                Err(err)
            }
        }
    }
}

impl<K: ScopeKind> Drop for BoundContext<K> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                target: "rowguard::binder",
                kind = K::NAME,
                state = %self.state,
                "context dropped without release; closing connection"
            );
            discard(conn);
        }
    }
}

impl<K: ScopeKind> fmt::Debug for BoundContext<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundContext")
            .field("kind", &K::NAME)
            .field("id", &self.id())
            .field("state", &self.state)
            .finish()
    }
}

/// Takes the connection out of the pool for good.
fn discard(conn: PoolConnection<Postgres>) {
    metrics::metrics().record_discard();
    drop(conn.detach());
}
