use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

use crate::{
    Error, Result,
    binder::ContextBinder,
    catalog::Catalog,
    scope::{Branch, ScopeKind, Tenant},
};

/// Postgres `insufficient_privilege`, raised when a `with check` clause
/// rejects a row.
const POLICY_VIOLATION: &str = "42501";

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Product {
    pub id: Uuid,
    pub tenant_id: i32,
    pub name: String,
    pub price_cents: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewProduct {
    #[serde(default)]
    pub tenant_id: Option<i32>,
    pub name: String,
    #[serde(default)]
    pub price_cents: i64,
    #[serde(default)]
    pub description: Option<String>,
}

impl NewProduct {
    pub fn new(name: impl Into<String>, price_cents: i64) -> Self {
        Self {
            tenant_id: None,
            name: name.into(),
            price_cents,
            description: None,
        }
    }

    pub fn tenant(mut self, tenant_id: i32) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Clone, Debug, Serialize, sqlx::FromRow)]
pub struct Sale {
    pub id: Uuid,
    pub branch_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub amount_cents: i64,
    pub sold_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct NewSale {
    #[serde(default)]
    pub branch_id: Option<Uuid>,
    pub product_name: String,
    pub quantity: i32,
    pub amount_cents: i64,
}

impl NewSale {
    pub fn new(product_name: impl Into<String>, quantity: i32, amount_cents: i64) -> Self {
        Self {
            branch_id: None,
            product_name: product_name.into(),
            quantity,
            amount_cents,
        }
    }

    pub fn branch(mut self, branch_id: Uuid) -> Self {
        self.branch_id = Some(branch_id);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SalesSummary {
    pub sales: i64,
    pub units: i64,
    pub revenue_cents: i64,
}

/// Resolves the scope a write lands in and checks it is still active.
async fn write_scope<K: ScopeKind>(
    conn: &mut PgConnection,
    explicit: Option<K::Id>,
) -> Result<K::Id> {
    let id = match explicit {
        Some(id) => id,
        None => ContextBinder::<K>::bound_id(conn)
            .await?
            .ok_or(Error::MissingScope { kind: K::NAME })?,
    };
    if !K::is_valid_id(&id) {
        return Err(Error::MalformedIdentity {
            kind: K::NAME,
            value: id.to_string(),
        });
    }
    if !Catalog::<K>::is_active_on(conn, id).await? {
        return Err(Error::UnknownOrInactiveScope {
            kind: K::NAME,
            value: id.to_string(),
        });
    }
    Ok(id)
}

fn map_write_error<K: ScopeKind>(err: sqlx::Error, what: &'static str, key: &str) -> Error {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateRecord {
            what,
            key: key.to_string(),
        },
        sqlx::Error::Database(db) if db.code().as_deref() == Some(POLICY_VIOLATION) => {
            Error::ScopeMismatch { kind: K::NAME }
        }
        _ => Error::Db(err),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Products;

impl Products {
    pub async fn create(&self, conn: &mut PgConnection, new: NewProduct) -> Result<Product> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("product name must not be empty".into()));
        }
        if new.price_cents < 0 {
            return Err(Error::InvalidInput("price must not be negative".into()));
        }
        let tenant_id = write_scope::<Tenant>(conn, new.tenant_id).await?;

        sqlx::query_as::<_, Product>(
            "insert into products (tenant_id, name, price_cents, description) values ($1, $2, $3, $4) \
             returning id, tenant_id, name, price_cents, description, created_at",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(new.price_cents)
        .bind(&new.description)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_write_error::<Tenant>(e, "product", name))
    }

    pub async fn list(&self, conn: &mut PgConnection) -> Result<Vec<Product>> {
        let rows = sqlx::query_as::<_, Product>(
            "select id, tenant_id, name, price_cents, description, created_at \
             from products order by name",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self, conn: &mut PgConnection) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(*) from products")
            .fetch_one(&mut *conn)
            .await?;
        Ok(n)
    }

    /// Count restricted to one tenant id on top of whatever the policy allows.
    pub async fn count_for(&self, conn: &mut PgConnection, tenant_id: i32) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(*) from products where tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&mut *conn)
            .await?;
        Ok(n)
    }

    pub async fn delete_visible(&self, conn: &mut PgConnection) -> Result<u64> {
        let done = sqlx::query("delete from products")
            .execute(&mut *conn)
            .await?;
        Ok(done.rows_affected())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Sales;

impl Sales {
    pub async fn record(&self, conn: &mut PgConnection, new: NewSale) -> Result<Sale> {
        let product = new.product_name.trim();
        if product.is_empty() {
            return Err(Error::InvalidInput("product name must not be empty".into()));
        }
        if new.quantity <= 0 {
            return Err(Error::InvalidInput("quantity must be positive".into()));
        }
        if new.amount_cents < 0 {
            return Err(Error::InvalidInput("amount must not be negative".into()));
        }
        let branch_id = write_scope::<Branch>(conn, new.branch_id).await?;

        sqlx::query_as::<_, Sale>(
            "insert into sales (branch_id, product_name, quantity, amount_cents) values ($1, $2, $3, $4) \
             returning id, branch_id, product_name, quantity, amount_cents, sold_at",
        )
        .bind(branch_id)
        .bind(product)
        .bind(new.quantity)
        .bind(new.amount_cents)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_write_error::<Branch>(e, "sale", product))
    }

    pub async fn list(&self, conn: &mut PgConnection, limit: i64) -> Result<Vec<Sale>> {
        let rows = sqlx::query_as::<_, Sale>(
            "select id, branch_id, product_name, quantity, amount_cents, sold_at \
             from sales order by sold_at desc, id limit $1",
        )
        .bind(limit.max(0))
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn count(&self, conn: &mut PgConnection) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("select count(*) from sales")
            .fetch_one(&mut *conn)
            .await?;
        Ok(n)
    }

    pub async fn summary(&self, conn: &mut PgConnection) -> Result<SalesSummary> {
        let (sales, units, revenue_cents): (i64, i64, i64) = sqlx::query_as(
            "select count(*), coalesce(sum(quantity), 0)::bigint, coalesce(sum(amount_cents), 0)::bigint \
             from sales",
        )
        .fetch_one(&mut *conn)
        .await?;
        Ok(SalesSummary {
            sales,
            units,
            revenue_cents,
        })
    }

    pub async fn delete_visible(&self, conn: &mut PgConnection) -> Result<u64> {
        let done = sqlx::query("delete from sales").execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }
}
