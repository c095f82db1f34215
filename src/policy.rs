use indoc::formatdoc;
use serde::Serialize;

use crate::{
    schema::{qualified_name, quote_ident},
    scope::{Branch, ScopeKind, Tenant},
};

pub const DEFAULT_POLICY_VERSION: u32 = 1;
pub const POLICY_REGISTRY_TABLE: &str = "isolation_policies";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedTable {
    Products,
    Sales,
}

impl ProtectedTable {
    pub const ALL: [ProtectedTable; 2] = [ProtectedTable::Products, ProtectedTable::Sales];

    pub fn table_name(&self) -> &'static str {
        match self {
            ProtectedTable::Products => "products",
            ProtectedTable::Sales => "sales",
        }
    }

    pub fn scope_column(&self) -> &'static str {
        match self {
            ProtectedTable::Products => Tenant::COLUMN,
            ProtectedTable::Sales => Branch::COLUMN,
        }
    }

    pub fn policy(&self, version: u32) -> PolicyDefinition {
        match self {
            ProtectedTable::Products => PolicyDefinition::new::<Tenant>(self.table_name(), version),
            ProtectedTable::Sales => PolicyDefinition::new::<Branch>(self.table_name(), version),
        }
    }
}

/// A row policy admits a row only when its scope column equals the bound key.
/// Unset, empty or malformed settings evaluate to NULL and match nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDefinition {
    pub table: String,
    pub column: String,
    pub kind: &'static str,
    pub version: u32,
    key_expr: String,
    guard: Option<String>,
}

impl PolicyDefinition {
    pub fn new<K: ScopeKind>(table: impl Into<String>, version: u32) -> Self {
        let column = quote_ident(K::COLUMN);
        Self {
            table: table.into(),
            column: K::COLUMN.to_string(),
            kind: K::NAME,
            version,
            key_expr: K::policy_key_expr(),
            guard: K::column_guard(&column),
        }
    }

    pub fn name(&self) -> String {
        policy_name(&self.table, self.kind, self.version)
    }

    /// Prefix shared by every version of this table's policy.
    pub fn name_prefix(&self) -> String {
        format!("{}_{}_isolation_v", self.table, self.kind)
    }

    pub fn predicate(&self) -> String {
        let column = quote_ident(&self.column);
        let key = &self.key_expr;
        let mut predicate = format!("{column} = ({key}) and ({key}) is not null");
        if let Some(guard) = &self.guard {
            predicate.push_str(" and ");
            predicate.push_str(guard);
        }
        predicate
    }

    pub fn enable_sql(&self, schema: &str) -> String {
        format!(
            "alter table {} enable row level security",
            qualified_name(schema, &self.table)
        )
    }

    pub fn force_sql(&self, schema: &str) -> String {
        format!(
            "alter table {} force row level security",
            qualified_name(schema, &self.table)
        )
    }

    pub fn create_sql(&self, schema: &str) -> String {
        let predicate = self.predicate();
        formatdoc!(
            "create policy {name} on {table}
                as permissive
                for all
                using ({predicate})
                with check ({predicate})",
            name = quote_ident(&self.name()),
            table = qualified_name(schema, &self.table),
        )
    }

    pub fn drop_sql(&self, schema: &str, name: &str) -> String {
        format!(
            "drop policy if exists {} on {}",
            quote_ident(name),
            qualified_name(schema, &self.table)
        )
    }

    pub fn register_sql(&self, schema: &str) -> String {
        formatdoc!(
            "insert into {registry} (table_name, policy_name, version)
             values ({table}, {name}, {version})
             on conflict (table_name) do update
                set policy_name = excluded.policy_name,
                    version = excluded.version,
                    installed_at = now()",
            registry = qualified_name(schema, POLICY_REGISTRY_TABLE),
            table = quote_literal(&self.table),
            name = quote_literal(&self.name()),
            version = self.version,
        )
    }

    pub fn revoke_public_sql(&self, schema: &str) -> String {
        format!(
            "revoke all on {} from public",
            qualified_name(schema, &self.table)
        )
    }
}

pub fn policy_name(table: &str, kind: &str, version: u32) -> String {
    format!("{table}_{kind}_isolation_v{version}")
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_versioned_per_table_and_kind() {
        let p = ProtectedTable::Products.policy(3);
        assert_eq!(p.name(), "products_tenant_isolation_v3");
        assert!(p.name().starts_with(&p.name_prefix()));
        assert_eq!(
            ProtectedTable::Sales.policy(1).name(),
            "sales_branch_isolation_v1"
        );
    }

    #[test]
    fn tenant_predicate_guards_every_cast() {
        let predicate = ProtectedTable::Products.policy(1).predicate();
        assert!(predicate.starts_with("\"tenant_id\" = "));
        assert!(predicate.contains("current_setting('app.current_tenant', true)"));
        assert!(predicate.contains("'^[1-9][0-9]{0,9}$'"));
        assert!(predicate.contains("<= 2147483647"));
        assert!(predicate.contains("is not null"));
        assert!(predicate.ends_with("\"tenant_id\" > 0"));
        assert!(!predicate.to_lowercase().contains("bypass"));
    }

    #[test]
    fn branch_predicate_only_casts_well_formed_uuids() {
        let predicate = ProtectedTable::Sales.policy(1).predicate();
        assert!(predicate.contains("current_setting('app.current_branch_id', true)"));
        assert!(predicate.contains("~*"));
        assert!(predicate.contains("::uuid"));
    }

    #[test]
    fn create_statement_covers_reads_and_writes() {
        let sql = ProtectedTable::Products.policy(1).create_sql("public");
        assert!(sql.contains("on \"public\".\"products\""));
        assert!(sql.contains("for all"));
        assert!(sql.contains("using ("));
        assert!(sql.contains("with check ("));
    }

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
