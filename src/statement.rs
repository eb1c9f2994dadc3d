//! Classification of caller-supplied SQL.
//!
//! Free-form SQL from `execute_query` and `show_explain_query` is parsed with the
//! MySQL dialect before it goes anywhere near a connection. Exactly one statement
//! is accepted, and only of the kinds the calling tool allows.

use sqlparser::ast::{SetExpr, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::error::ToolError;

/// What a single accepted statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows without changing anything.
    Read,
    /// INSERT, UPDATE or DELETE; returns a row count.
    Write,
}

/// A statement that passed classification, ready to send to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedStatement {
    pub sql: String,
    pub kind: StatementKind,
}

fn parse_single(sql: &str) -> Result<Statement, ToolError> {
    // Executable comments run their contents on MySQL but are invisible to the parser.
    if sql.contains("/*!") {
        return Err(ToolError::UnsupportedStatement(
            "MySQL executable comments are not allowed".into(),
        ));
    }

    let mut statements = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| ToolError::UnsupportedStatement(format!("could not parse statement: {e}")))?;

    match statements.len() {
        0 => Err(ToolError::UnsupportedStatement("statement is empty".into())),
        1 => Ok(statements.remove(0)),
        n => Err(ToolError::UnsupportedStatement(format!(
            "expected a single statement, found {n}"
        ))),
    }
}

/// SELECT ... INTO writes to variables or server-side files, wherever it is nested.
fn selects_into(body: &SetExpr) -> bool {
    match body {
        SetExpr::Select(select) => select.into.is_some(),
        SetExpr::Query(query) => selects_into(&query.body),
        SetExpr::SetOperation { left, right, .. } => selects_into(left) || selects_into(right),
        _ => false,
    }
}

fn is_plain_query(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => !selects_into(&query.body),
        _ => false,
    }
}

fn is_read_only(statement: &Statement) -> bool {
    match statement {
        Statement::Query { .. } => is_plain_query(statement),
        Statement::Explain { statement, .. } => is_read_only(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. } => true,
        _ => false,
    }
}

fn is_row_write(statement: &Statement) -> bool {
    matches!(
        statement,
        Statement::Insert { .. } | Statement::Update { .. } | Statement::Delete { .. }
    )
}

/// Strips surrounding whitespace and one trailing semicolon.
fn normalize(sql: &str) -> String {
    let trimmed = sql.trim();
    trimmed
        .strip_suffix(';')
        .unwrap_or(trimmed)
        .trim_end()
        .to_string()
}

/// Accepts a single statement suitable for `execute_query`.
///
/// Read-only statements are always accepted. Row writes are accepted only when
/// `allow_writes` is set; schema changes and everything else are rejected.
pub fn check_query(sql: &str, allow_writes: bool) -> Result<CheckedStatement, ToolError> {
    let statement = parse_single(sql)?;

    let kind = if is_read_only(&statement) {
        StatementKind::Read
    } else if is_row_write(&statement) {
        if !allow_writes {
            return Err(ToolError::UnsupportedStatement(
                "only read-only statements are allowed; set allow_dangerous_queries to permit INSERT, UPDATE and DELETE".into(),
            ));
        }
        StatementKind::Write
    } else {
        return Err(ToolError::UnsupportedStatement(
            "statement type is not permitted".into(),
        ));
    };

    Ok(CheckedStatement {
        sql: normalize(sql),
        kind,
    })
}

/// Accepts a single read-only SELECT for `show_explain_query`.
pub fn check_select(sql: &str) -> Result<CheckedStatement, ToolError> {
    let statement = parse_single(sql)?;
    if !is_plain_query(&statement) {
        return Err(ToolError::UnsupportedStatement(
            "only a single SELECT statement can be explained".into(),
        ));
    }
    Ok(CheckedStatement {
        sql: normalize(sql),
        kind: StatementKind::Read,
    })
}
