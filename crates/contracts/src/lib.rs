use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace hosting the cross-tenant SECURITY DEFINER utility functions.
/// It is the only namespace a validated statement may address by
/// schema-qualified name.
pub const HELPERS_NAMESPACE: &str = "postgate_helpers";

/// The closed operation vocabulary tokens are scoped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlOperation {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
}

impl SqlOperation {
    pub const ALL: [SqlOperation; 7] = [
        SqlOperation::Select,
        SqlOperation::Insert,
        SqlOperation::Update,
        SqlOperation::Delete,
        SqlOperation::Create,
        SqlOperation::Alter,
        SqlOperation::Drop,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SqlOperation::Select => "SELECT",
            SqlOperation::Insert => "INSERT",
            SqlOperation::Update => "UPDATE",
            SqlOperation::Delete => "DELETE",
            SqlOperation::Create => "CREATE",
            SqlOperation::Alter => "ALTER",
            SqlOperation::Drop => "DROP",
        }
    }

    pub fn parse(s: &str) -> Option<SqlOperation> {
        match s {
            "SELECT" => Some(SqlOperation::Select),
            "INSERT" => Some(SqlOperation::Insert),
            "UPDATE" => Some(SqlOperation::Update),
            "DELETE" => Some(SqlOperation::Delete),
            "CREATE" => Some(SqlOperation::Create),
            "ALTER" => Some(SqlOperation::Alter),
            "DROP" => Some(SqlOperation::Drop),
            _ => None,
        }
    }

    /// The default grant for freshly created tokens (DML only).
    pub fn default_set() -> HashSet<SqlOperation> {
        HashSet::from([
            SqlOperation::Select,
            SqlOperation::Insert,
            SqlOperation::Update,
            SqlOperation::Delete,
        ])
    }
}

impl std::fmt::Display for SqlOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a tenant's data lives: an isolated namespace inside the host
/// cluster, or an external database reached by DSN. Exactly one of the two,
/// by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantBackend {
    Shared { namespace: String },
    Dedicated { dsn: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub backend: TenantBackend,
    pub row_cap: i32,
    pub created_at: DateTime<Utc>,
}

/// A persisted credential. Only the SHA-256 of the secret is ever stored;
/// the plaintext exists once, at creation.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub hash: String,
    pub prefix: String,
    pub permissions: HashSet<SqlOperation>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Listing view of a token: everything except the credential material.
#[derive(Debug, Clone)]
pub struct TokenSummary {
    pub id: Uuid,
    pub name: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Derived at auth time by joining a token with its tenant; carried through
/// the rest of the request.
#[derive(Debug, Clone)]
pub struct Policy {
    pub tenant: Tenant,
    pub token_id: Uuid,
    pub allowed_ops: HashSet<SqlOperation>,
}

impl Policy {
    pub fn backend(&self) -> &TenantBackend {
        &self.tenant.backend
    }

    pub fn row_cap(&self) -> i32 {
        self.tenant.row_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names_round_trip() {
        for op in SqlOperation::ALL {
            assert_eq!(SqlOperation::parse(op.as_str()), Some(op));
        }
    }

    #[test]
    fn unknown_operation_names_are_rejected() {
        assert_eq!(SqlOperation::parse("GRANT"), None);
        assert_eq!(SqlOperation::parse("select"), None);
        assert_eq!(SqlOperation::parse(""), None);
    }

    #[test]
    fn default_set_is_dml_only() {
        let ops = SqlOperation::default_set();
        assert_eq!(ops.len(), 4);
        assert!(ops.contains(&SqlOperation::Select));
        assert!(!ops.contains(&SqlOperation::Create));
        assert!(!ops.contains(&SqlOperation::Drop));
    }
}
