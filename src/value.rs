use serde::Serialize;
use serde_json::{json, Value};

/// A value bound into a statement as a parameter. Values never become part of
/// the SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    UInt(u64),
    Text(String),
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::UInt(v)
    }
}

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Normalized tabular result: ordered columns, ordered rows of JSON scalars.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Value>>,
    /// More rows existed than the cap allowed through.
    pub truncated: bool,
}

impl RowSet {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Iterates the values of column `name`, yielding `Null` when the column is absent.
    pub fn column_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Value> + 'a {
        let index = self.column_index(name);
        self.rows
            .iter()
            .map(move |row| index.and_then(|i| row.get(i)).unwrap_or(&NULL))
    }

    pub fn get<'a>(&self, row: &'a [Value], name: &str) -> &'a Value {
        self.column_index(name)
            .and_then(|i| row.get(i))
            .unwrap_or(&NULL)
    }
}

/// What a tool call produces on success.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    Table(RowSet),
    Status(Value),
}

impl QueryResult {
    pub fn to_json(&self) -> Value {
        match self {
            QueryResult::Table(rows) => json!({
                "columns": rows.columns,
                "rows": rows.rows,
                "row_count": rows.rows.len(),
                "truncated": rows.truncated,
            }),
            QueryResult::Status(value) => value.clone(),
        }
    }

    /// One-line description for the text part of a tool result.
    pub fn summary(&self) -> String {
        match self {
            QueryResult::Table(rows) if rows.truncated => format!(
                "Query executed successfully. Retrieved {} rows (truncated).",
                rows.rows.len()
            ),
            QueryResult::Table(rows) => format!(
                "Query executed successfully. Retrieved {} rows.",
                rows.rows.len()
            ),
            QueryResult::Status(_) => "Completed successfully.".to_string(),
        }
    }
}
