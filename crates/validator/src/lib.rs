use std::collections::HashSet;
use std::ops::ControlFlow;

use postgate_contracts::{HELPERS_NAMESPACE, SqlOperation};
use sqlparser::ast::{ObjectNamePart, Statement, visit_relations};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

#[derive(Debug)]
pub enum ValidateError {
    Syntax(sqlparser::parser::ParserError),
    Empty,
    MultipleStatements,
    UnsupportedOperation,
    OperationDenied(SqlOperation),
    QualifiedName,
    SystemObject,
}

impl std::fmt::Display for ValidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidateError::Syntax(err) => write!(f, "failed to parse SQL: {}", err),
            ValidateError::Empty => write!(f, "empty statement"),
            ValidateError::MultipleStatements => {
                write!(f, "multiple statements are not allowed")
            }
            ValidateError::UnsupportedOperation => write!(f, "unsupported statement kind"),
            ValidateError::OperationDenied(op) => {
                write!(f, "operation {} is not permitted for this token", op)
            }
            ValidateError::QualifiedName => {
                write!(f, "schema-qualified names are not allowed")
            }
            ValidateError::SystemObject => write!(f, "system catalogs are not accessible"),
        }
    }
}

impl std::error::Error for ValidateError {}

impl From<sqlparser::parser::ParserError> for ValidateError {
    fn from(value: sqlparser::parser::ParserError) -> Self {
        ValidateError::Syntax(value)
    }
}

/// The validator's verdict: the original SQL is safe to hand to the
/// executor, classified as `operation`.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedStatement {
    pub operation: SqlOperation,
}

/// Parse exactly one statement in the PostgreSQL dialect and check it
/// against the token's allowed operations. Execution binds the search path
/// to a single tenant namespace, so the only escape routes are
/// schema-qualified names and the system catalogs; both are closed here.
pub fn validate(
    sql: &str,
    allowed_ops: &HashSet<SqlOperation>,
) -> Result<ValidatedStatement, ValidateError> {
    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql)?;

    if statements.is_empty() {
        return Err(ValidateError::Empty);
    }
    if statements.len() > 1 {
        return Err(ValidateError::MultipleStatements);
    }

    let statement = statements.remove(0);
    let operation = classify(&statement)?;

    if !allowed_ops.contains(&operation) {
        return Err(ValidateError::OperationDenied(operation));
    }

    scan_relations(&statement)?;

    Ok(ValidatedStatement { operation })
}

fn classify(statement: &Statement) -> Result<SqlOperation, ValidateError> {
    match statement {
        Statement::Query { .. } => Ok(SqlOperation::Select),
        Statement::Insert { .. } => Ok(SqlOperation::Insert),
        Statement::Update { .. } => Ok(SqlOperation::Update),
        Statement::Delete { .. } => Ok(SqlOperation::Delete),
        Statement::CreateTable { .. }
        | Statement::CreateIndex { .. }
        | Statement::CreateView { .. } => Ok(SqlOperation::Create),
        Statement::AlterTable { .. } => Ok(SqlOperation::Alter),
        Statement::Drop { .. } | Statement::Truncate { .. } => Ok(SqlOperation::Drop),
        // BEGIN/COMMIT/SET/GRANT/VACUUM/COPY and everything else the
        // vocabulary does not name.
        _ => Err(ValidateError::UnsupportedOperation),
    }
}

/// Walk every relation reference in the statement. Qualified names are
/// rejected unless the leading part is the helpers namespace; any part that
/// names a system catalog is rejected outright.
fn scan_relations(statement: &Statement) -> Result<(), ValidateError> {
    let mut verdict: Result<(), ValidateError> = Ok(());

    let _ = visit_relations(statement, |relation| {
        let parts: Vec<String> = relation
            .0
            .iter()
            .filter_map(|part| match part {
                ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
                _ => None,
            })
            .collect();

        if let Err(err) = check_reference(&parts) {
            verdict = Err(err);
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    });

    verdict
}

fn check_reference(parts: &[String]) -> Result<(), ValidateError> {
    if parts.len() > 1 && parts[0] != HELPERS_NAMESPACE {
        return Err(ValidateError::QualifiedName);
    }

    for part in parts {
        let lowered = part.to_lowercase();
        if lowered.starts_with("pg_") || lowered == "information_schema" {
            return Err(ValidateError::SystemObject);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dml_ops() -> HashSet<SqlOperation> {
        SqlOperation::default_set()
    }

    fn all_ops() -> HashSet<SqlOperation> {
        SqlOperation::ALL.into_iter().collect()
    }

    #[test]
    fn classifies_select() {
        let parsed = validate("SELECT * FROM users WHERE id = $1", &dml_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Select);
    }

    #[test]
    fn classifies_dml() {
        let parsed =
            validate("INSERT INTO users (name, email) VALUES ($1, $2)", &dml_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Insert);

        let parsed = validate(
            "INSERT INTO users (name) VALUES ($1) RETURNING id",
            &dml_ops(),
        )
        .unwrap();
        assert_eq!(parsed.operation, SqlOperation::Insert);

        let parsed = validate(
            "DELETE FROM users WHERE id = $1 RETURNING id",
            &dml_ops(),
        )
        .unwrap();
        assert_eq!(parsed.operation, SqlOperation::Delete);
    }

    #[test]
    fn classifies_ddl() {
        let parsed = validate("CREATE TABLE t (x int)", &all_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Create);

        let parsed = validate("ALTER TABLE t ADD COLUMN y int", &all_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Alter);

        let parsed = validate("DROP TABLE t", &all_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Drop);

        let parsed = validate("TRUNCATE t", &all_ops()).unwrap();
        assert_eq!(parsed.operation, SqlOperation::Drop);
    }

    #[test]
    fn denies_operation_outside_the_grant() {
        let only_select = HashSet::from([SqlOperation::Select]);
        let err = validate("UPDATE users SET name = $1", &only_select).unwrap_err();
        assert!(matches!(
            err,
            ValidateError::OperationDenied(SqlOperation::Update)
        ));
    }

    #[test]
    fn rejects_multiple_statements() {
        let err = validate("SELECT 1; DROP TABLE t", &all_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::MultipleStatements));
    }

    #[test]
    fn rejects_empty_input() {
        let err = validate("", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::Empty));

        let err = validate("   ", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::Empty));
    }

    #[test]
    fn rejects_unsupported_statement_kinds() {
        for sql in [
            "BEGIN",
            "COMMIT",
            "SET search_path TO public",
            "GRANT SELECT ON t TO someone",
        ] {
            let err = validate(sql, &all_ops()).unwrap_err();
            assert!(
                matches!(err, ValidateError::UnsupportedOperation),
                "expected {:?} to be unsupported, got {:?}",
                sql,
                err
            );
        }
    }

    #[test]
    fn rejects_qualified_names() {
        let err = validate("SELECT * FROM public.users", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::QualifiedName));

        let err = validate("SELECT * FROM other_schema.secrets", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::QualifiedName));

        let err = validate("SELECT * FROM pg_catalog.pg_tables", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::QualifiedName));

        let err =
            validate("SELECT * FROM information_schema.tables", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::QualifiedName));
    }

    #[test]
    fn rejects_system_objects_at_any_position() {
        let err = validate("SELECT * FROM pg_tables", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::SystemObject));

        let err = validate("SELECT * FROM pg_namespace", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::SystemObject));

        // case variations are still catalog access
        let err = validate("SELECT * FROM \"PG_tables\"", &dml_ops()).unwrap_err();
        assert!(matches!(err, ValidateError::SystemObject));
    }

    #[test]
    fn allows_the_helpers_namespace() {
        let parsed = validate(
            "SELECT * FROM postgate_helpers.list_tables()",
            &dml_ops(),
        )
        .unwrap();
        assert_eq!(parsed.operation, SqlOperation::Select);

        let parsed = validate(
            "SELECT * FROM postgate_helpers.describe_table('users')",
            &dml_ops(),
        )
        .unwrap();
        assert_eq!(parsed.operation, SqlOperation::Select);
    }

    #[test]
    fn helpers_exemption_does_not_cover_system_names() {
        let err = validate(
            "SELECT * FROM postgate_helpers.pg_sneaky()",
            &dml_ops(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidateError::SystemObject));
    }

    #[test]
    fn scans_joined_relations() {
        let err = validate(
            "SELECT * FROM users u JOIN public.orders o ON o.user_id = u.id",
            &dml_ops(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidateError::QualifiedName));
    }
}
