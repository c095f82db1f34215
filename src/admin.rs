use sqlx::PgPool;
use tracing::warn;

use crate::{
    Error, Result,
    metrics,
    policy::ProtectedTable,
    schema::quote_ident,
    scope::ScopeKind,
};

/// Cross-scope access through a pool whose role bypasses row security.
/// Every call is logged on `rowguard::audit` with its stated reason.
#[derive(Clone)]
pub struct AdminAccess {
    pool: PgPool,
    reason: String,
}

impl AdminAccess {
    pub(crate) fn new(pool: PgPool, reason: impl Into<String>) -> Self {
        Self {
            pool,
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn audit(&self, operation: &'static str, table: ProtectedTable, scope: Option<String>) {
        metrics::metrics().record_admin_access();
        warn!(
            target: "rowguard::audit",
            reason = %self.reason,
            operation,
            table = table.table_name(),
            scope = scope.as_deref().unwrap_or("*"),
            "cross-scope access"
        );
    }

    /// Row count across every scope.
    pub async fn count_all(&self, table: ProtectedTable) -> Result<i64> {
        self.audit("count_all", table, None);
        let sql = format!("select count(*) from {}", quote_ident(table.table_name()));
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(n)
    }

    pub async fn count_for_scope<K: ScopeKind>(&self, table: ProtectedTable, id: K::Id) -> Result<i64> {
        check_table::<K>(table)?;
        self.audit("count_for_scope", table, Some(id.to_string()));
        let sql = format!(
            "select count(*) from {} where {} = $1",
            quote_ident(table.table_name()),
            quote_ident(K::COLUMN)
        );
        let n: i64 = sqlx::query_scalar(&sql).bind(id).fetch_one(&self.pool).await?;
        Ok(n)
    }

    /// Deletes every row the scope owns in `table`.
    pub async fn purge_scope<K: ScopeKind>(&self, table: ProtectedTable, id: K::Id) -> Result<u64> {
        check_table::<K>(table)?;
        self.audit("purge_scope", table, Some(id.to_string()));
        let sql = format!(
            "delete from {} where {} = $1",
            quote_ident(table.table_name()),
            quote_ident(K::COLUMN)
        );
        let done = sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }
}

fn check_table<K: ScopeKind>(table: ProtectedTable) -> Result<()> {
    if table.scope_column() == K::COLUMN {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "{} rows are not scoped by {}",
            table.table_name(),
            K::NAME
        )))
    }
}
