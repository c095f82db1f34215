use std::collections::HashSet;

use crate::{
    Result,
    policy::{DEFAULT_POLICY_VERSION, POLICY_REGISTRY_TABLE, PolicyDefinition, ProtectedTable},
    scope::{Branch, ScopeKind, Tenant},
};
use indoc::formatdoc;
use sqlx::PgPool;
use tracing::info;

const PROTECTED_PRIVILEGES: &[&str] = &["SELECT", "INSERT", "UPDATE", "DELETE"];
const CATALOG_PRIVILEGES: &[&str] = &["SELECT", "INSERT", "UPDATE"];
const REGISTRY_PRIVILEGES: &[&str] = &["SELECT"];

#[derive(Clone, Debug)]
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let mut plan = SchemaPlan::default();
        let schema = config.schema.trim();
        if schema.is_empty() {
            plan.push_warning("schema name is empty; nothing planned".to_string());
            return Ok(plan);
        }

        let schema_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.schemata where schema_name = $1)",
        )
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        if !schema_exists {
            plan.push_action(
                format!("create schema {}", quote_ident(schema)),
                format!("create schema if not exists {}", quote_ident(schema)),
            );
        }

        let existing_tables = if schema_exists {
            self.existing_tables(schema).await?
        } else {
            HashSet::new()
        };

        ensure_table(&mut plan, schema, &existing_tables, "tenants", build_tenants_table_sql);
        ensure_table(&mut plan, schema, &existing_tables, "branches", build_branches_table_sql);
        ensure_table(&mut plan, schema, &existing_tables, "tenant_members", |s| {
            build_members_table_sql::<Tenant>(s)
        });
        ensure_table(&mut plan, schema, &existing_tables, "branch_members", |s| {
            build_members_table_sql::<Branch>(s)
        });
        ensure_table(&mut plan, schema, &existing_tables, "products", build_products_table_sql);
        ensure_table(&mut plan, schema, &existing_tables, "sales", build_sales_table_sql);
        ensure_table(
            &mut plan,
            schema,
            &existing_tables,
            POLICY_REGISTRY_TABLE,
            build_policy_registry_table_sql,
        );

        let existing_indexes = if schema_exists {
            self.existing_indexes(schema).await?
        } else {
            HashSet::new()
        };
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "products_tenant_idx",
            |s| {
                format!(
                    "create index if not exists products_tenant_idx on {} (tenant_id)",
                    qualified_name(s, "products")
                )
            },
        );
        ensure_index(
            &mut plan,
            schema,
            &existing_indexes,
            "sales_branch_sold_at_idx",
            |s| {
                format!(
                    "create index if not exists sales_branch_sold_at_idx on {} (branch_id, sold_at desc)",
                    qualified_name(s, "sales")
                )
            },
        );

        for table in ProtectedTable::ALL {
            let policy = table.policy(config.policy_version);
            let exists = existing_tables.contains(table.table_name());
            self.plan_policy(&mut plan, schema, &policy, exists).await?;
        }

        if let Some(role) = config.app_role.as_deref() {
            let creates_tables = plan.actions.iter().any(|a| a.description().starts_with("create table"));
            self.plan_grants(&mut plan, schema, role, creates_tables).await?;
        }

        Ok(plan)
    }

    pub async fn apply(&self, plan: &SchemaPlan) -> Result<()> {
        if plan.actions.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for action in &plan.actions {
            sqlx::query(action.sql()).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(actions = plan.actions.len(), "schema plan applied");
        Ok(())
    }

    pub async fn sync(&self, config: &SchemaConfig) -> Result<SchemaPlan> {
        let plan = self.plan(config).await?;
        if !plan.is_empty() {
            self.apply(&plan).await?;
        }
        Ok(plan)
    }

    async fn plan_policy(
        &self,
        plan: &mut SchemaPlan,
        schema: &str,
        policy: &PolicyDefinition,
        table_exists: bool,
    ) -> Result<()> {
        let table = qualified_name(schema, &policy.table);
        let (enabled, forced) = if table_exists {
            self.row_security(schema, &policy.table).await?
        } else {
            (false, false)
        };
        if !enabled {
            plan.push_action(
                format!("enable row level security on {table}"),
                policy.enable_sql(schema),
            );
        }
        if !forced {
            plan.push_action(
                format!("force row level security on {table}"),
                policy.force_sql(schema),
            );
        }

        let existing = if table_exists {
            self.existing_policies(schema, &policy.table).await?
        } else {
            HashSet::new()
        };
        let wanted = policy.name();
        let prefix = policy.name_prefix();
        let mut stale: Vec<&String> = existing
            .iter()
            .filter(|name| name.starts_with(&prefix) && **name != wanted)
            .collect();
        stale.sort();
        for name in stale {
            plan.push_action(
                format!("drop superseded policy {name} on {table}"),
                policy.drop_sql(schema, name),
            );
        }
        for name in existing.iter().filter(|name| !name.starts_with(&prefix)) {
            plan.push_warning(format!(
                "policy `{name}` on {table} is not managed here; permissive policies widen visibility"
            ));
        }

        let registered = existing.contains(&wanted)
            && self.registered_version(schema, &policy.table).await? == Some(policy.version);
        if !existing.contains(&wanted) {
            plan.push_action(
                format!("create policy {wanted} on {table}"),
                policy.create_sql(schema),
            );
        }
        if !registered {
            plan.push_action(
                format!("register policy {wanted}"),
                policy.register_sql(schema),
            );
        }
        Ok(())
    }

    /// `creates_tables` means identity sequences will appear once the plan
    /// runs, so sequence usage is granted up front.
    async fn plan_grants(
        &self,
        plan: &mut SchemaPlan,
        schema: &str,
        role: &str,
        creates_tables: bool,
    ) -> Result<()> {
        let attrs: Option<(bool, bool)> =
            sqlx::query_as("select rolsuper, rolbypassrls from pg_roles where rolname = $1")
                .bind(role)
                .fetch_optional(&self.pool)
                .await?;
        let Some((superuser, bypass)) = attrs else {
            plan.push_warning(format!(
                "application role `{role}` does not exist; grants skipped"
            ));
            return Ok(());
        };
        if superuser || bypass {
            plan.push_warning(format!(
                "application role `{role}` bypasses row level security; isolation is not enforced for it"
            ));
        }

        let has_usage: bool = sqlx::query_scalar(
            "select case when exists (select 1 from pg_namespace where nspname = $2) \
             then has_schema_privilege($1, $2, 'USAGE') else false end",
        )
        .bind(role)
        .bind(schema)
        .fetch_one(&self.pool)
        .await?;
        if !has_usage {
            plan.push_action(
                format!("grant usage on schema {} to {role}", quote_ident(schema)),
                format!(
                    "grant usage on schema {} to {}",
                    quote_ident(schema),
                    quote_ident(role)
                ),
            );
        }

        let grants: [(&str, &[&str]); 7] = [
            (Tenant::CATALOG_TABLE, CATALOG_PRIVILEGES),
            (Branch::CATALOG_TABLE, CATALOG_PRIVILEGES),
            (Tenant::MEMBER_TABLE, CATALOG_PRIVILEGES),
            (Branch::MEMBER_TABLE, CATALOG_PRIVILEGES),
            (ProtectedTable::Products.table_name(), PROTECTED_PRIVILEGES),
            (ProtectedTable::Sales.table_name(), PROTECTED_PRIVILEGES),
            (POLICY_REGISTRY_TABLE, REGISTRY_PRIVILEGES),
        ];
        for (table, privileges) in grants {
            let missing = self
                .missing_privileges(schema, table, role, privileges)
                .await?;
            if !missing.is_empty() {
                let list = missing.join(", ").to_lowercase();
                plan.push_action(
                    format!("grant {list} on {} to {role}", qualified_name(schema, table)),
                    format!(
                        "grant {list} on {} to {}",
                        qualified_name(schema, table),
                        quote_ident(role)
                    ),
                );
            }
        }

        for table in ProtectedTable::ALL {
            let public = self
                .missing_privileges(schema, table.table_name(), "public", PROTECTED_PRIVILEGES)
                .await?;
            if public.len() < PROTECTED_PRIVILEGES.len() {
                let policy = table.policy(DEFAULT_POLICY_VERSION);
                plan.push_action(
                    format!("revoke public access on {}", qualified_name(schema, &policy.table)),
                    policy.revoke_public_sql(schema),
                );
            }
        }

        let sequences = self.sequences_without_usage(schema, role).await?;
        if creates_tables || !sequences.is_empty() {
            plan.push_action(
                format!("grant sequence usage in {} to {role}", quote_ident(schema)),
                format!(
                    "grant usage on all sequences in schema {} to {}",
                    quote_ident(schema),
                    quote_ident(role)
                ),
            );
        }
        Ok(())
    }

    async fn existing_tables(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select table_name from information_schema.tables where table_schema = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_indexes(&self, schema: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select indexname from pg_indexes where schemaname = $1",
        )
        .bind(schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn existing_policies(&self, schema: &str, table: &str) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "select policyname from pg_policies where schemaname = $1 and tablename = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn row_security(&self, schema: &str, table: &str) -> Result<(bool, bool)> {
        let row: Option<(bool, bool)> = sqlx::query_as(
            "select c.relrowsecurity, c.relforcerowsecurity from pg_class c \
             join pg_namespace n on n.oid = c.relnamespace \
             where n.nspname = $1 and c.relname = $2",
        )
        .bind(schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or((false, false)))
    }

    async fn registered_version(&self, schema: &str, table: &str) -> Result<Option<u32>> {
        let registry_exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.tables where table_schema = $1 and table_name = $2)",
        )
        .bind(schema)
        .bind(POLICY_REGISTRY_TABLE)
        .fetch_one(&self.pool)
        .await?;
        if !registry_exists {
            return Ok(None);
        }
        let sql = format!(
            "select version from {} where table_name = $1",
            qualified_name(schema, POLICY_REGISTRY_TABLE)
        );
        let version: Option<i32> = sqlx::query_scalar(&sql)
            .bind(table)
            .fetch_optional(&self.pool)
            .await?;
        Ok(version.and_then(|v| u32::try_from(v).ok()))
    }

    /// Privileges from `wanted` that `role` lacks on the table. A table that
    /// does not exist yet lacks all of them.
    async fn missing_privileges(
        &self,
        schema: &str,
        table: &str,
        role: &str,
        wanted: &[&str],
    ) -> Result<Vec<String>> {
        let wanted: Vec<String> = wanted.iter().map(|p| p.to_string()).collect();
        let exists: bool = sqlx::query_scalar(
            "select exists (select 1 from information_schema.tables where table_schema = $1 and table_name = $2)",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        if !exists {
            return Ok(wanted);
        }
        let rows = sqlx::query_scalar::<_, String>(
            "select p from unnest($3::text[]) as p where not has_table_privilege($1, $2::regclass, p)",
        )
        .bind(role)
        .bind(qualified_name(schema, table))
        .bind(&wanted)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn sequences_without_usage(&self, schema: &str, role: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            // The relkind filter is not guaranteed to run first, so the privilege
            // check only sees sequences through the case guard.
            "select c.relname::text from pg_class c join pg_namespace n on n.oid = c.relnamespace \
             where c.relkind = 'S' and n.nspname = $1 \
             and not (case when c.relkind = 'S' then has_sequence_privilege($2, c.oid, 'USAGE') else true end)",
        )
        .bind(schema)
        .bind(role)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Clone, Debug)]
pub struct SchemaConfig {
    pub schema: String,
    /// Role the application connects as. Grants are planned for it when set.
    pub app_role: Option<String>,
    pub policy_version: u32,
}

impl SchemaConfig {
    pub fn with_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Self::default()
        }
    }

    pub fn app_role(mut self, role: impl Into<String>) -> Self {
        self.app_role = Some(role.into());
        self
    }

    pub fn policy_version(mut self, version: u32) -> Self {
        self.policy_version = version.max(1);
        self
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            app_role: None,
            policy_version: DEFAULT_POLICY_VERSION,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
    warnings: Vec<String>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }

    fn push_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

fn ensure_table<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_tables: &HashSet<String>,
    table: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_tables.contains(table) {
        plan.push_action(
            format!("create table {}", qualified_name(schema, table)),
            build_sql(schema),
        );
    }
}

fn ensure_index<F>(
    plan: &mut SchemaPlan,
    schema: &str,
    existing_indexes: &HashSet<String>,
    index: &str,
    build_sql: F,
) where
    F: Fn(&str) -> String,
{
    if !existing_indexes.contains(index) {
        plan.push_action(
            format!("create index {}", qualified_name(schema, index)),
            build_sql(schema),
        );
    }
}

fn build_tenants_table_sql(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            id integer generated always as identity primary key,
            name text not null check (char_length(btrim(name)) between 1 and 100),
            subdomain text not null unique
                check (subdomain ~ '^[a-z0-9]([a-z0-9-]*[a-z0-9])?$' and char_length(subdomain) between 3 and 50),
            description text,
            is_active boolean not null default true,
            created_at timestamptz not null default now()
        )",
        table = qualified_name(schema, Tenant::CATALOG_TABLE),
    )
}

fn build_branches_table_sql(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            id uuid primary key default gen_random_uuid(),
            name text not null check (char_length(btrim(name)) between 1 and 100),
            code text not null unique
                check (code ~ '^[a-z0-9]([a-z0-9-]*[a-z0-9])?$' and char_length(code) between 3 and 50),
            description text,
            is_active boolean not null default true,
            created_at timestamptz not null default now()
        )",
        table = qualified_name(schema, Branch::CATALOG_TABLE),
    )
}

fn build_members_table_sql<K: ScopeKind>(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            id bigint generated always as identity primary key,
            {column} {key_type} not null references {catalog}(id) on delete restrict,
            username text not null check (char_length(btrim(username)) > 0),
            email text,
            is_active boolean not null default true,
            joined_at timestamptz not null default now(),
            unique ({column}, username)
        )",
        table = qualified_name(schema, K::MEMBER_TABLE),
        column = quote_ident(K::COLUMN),
        key_type = K::KEY_SQL_TYPE,
        catalog = qualified_name(schema, K::CATALOG_TABLE),
    )
}

fn build_products_table_sql(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            id uuid primary key default gen_random_uuid(),
            tenant_id integer not null check (tenant_id > 0)
                references {tenants}(id) on delete restrict,
            name text not null check (char_length(btrim(name)) > 0),
            price_cents bigint not null default 0 check (price_cents >= 0),
            description text,
            created_at timestamptz not null default now(),
            unique (tenant_id, name)
        )",
        table = qualified_name(schema, "products"),
        tenants = qualified_name(schema, Tenant::CATALOG_TABLE),
    )
}

fn build_sales_table_sql(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            id uuid primary key default gen_random_uuid(),
            branch_id uuid not null references {branches}(id) on delete restrict,
            product_name text not null check (char_length(btrim(product_name)) > 0),
            quantity integer not null check (quantity > 0),
            amount_cents bigint not null check (amount_cents >= 0),
            sold_at timestamptz not null default now()
        )",
        table = qualified_name(schema, "sales"),
        branches = qualified_name(schema, Branch::CATALOG_TABLE),
    )
}

fn build_policy_registry_table_sql(schema: &str) -> String {
    formatdoc!(
        "create table if not exists {table} (
            table_name text primary key,
            policy_name text not null,
            version integer not null check (version > 0),
            installed_at timestamptz not null default now()
        )",
        table = qualified_name(schema, POLICY_REGISTRY_TABLE),
    )
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}
