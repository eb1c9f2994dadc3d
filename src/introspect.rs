//! Read-only metadata queries: tables, columns, indexes and plans.

use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ToolError;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::statement::CheckedStatement;
use crate::value::{RowSet, SqlValue};

/// MySQL's error number for a missing table.
const ER_NO_SUCH_TABLE: &str = "1146";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub key: String,
    pub extra: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub index_type: String,
    pub cardinality: Option<u64>,
}

/// Table names of the schema, capped at the row ceiling.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableList {
    pub tables: Vec<String>,
    pub truncated: bool,
}

/// A page of rows from one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePage {
    pub rows: RowSet,
    pub limit: u64,
    pub offset: u64,
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub struct Introspector {
    executor: Executor,
    database: Identifier,
    max_rows: u64,
}

impl Introspector {
    pub fn new(executor: Executor, database: Identifier, max_rows: u64) -> Self {
        Introspector {
            executor,
            database,
            max_rows,
        }
    }

    pub fn max_rows(&self) -> u64 {
        self.max_rows
    }

    /// Lists base tables and views of the configured schema, alphabetically.
    pub async fn list_tables(&self) -> Result<TableList, ToolError> {
        let set = self
            .executor
            .fetch(
                "SELECT table_name AS table_name FROM information_schema.tables \
                 WHERE table_schema = ? ORDER BY table_name",
                &[self.database.as_str().into()],
                self.max_rows as usize,
            )
            .await?;
        let tables: Vec<String> = set.column_values("table_name").filter_map(as_text).collect();
        if set.truncated {
            warn!("Table list of '{}' cut off at {} entries", self.database, tables.len());
        }
        info!("Listed {} tables in '{}'", tables.len(), self.database);
        Ok(TableList {
            tables,
            truncated: set.truncated,
        })
    }

    /// Column definitions in ordinal order. Fails with engine code 1146 if the table is unknown.
    pub async fn get_table_schema(&self, table: &Identifier) -> Result<Vec<ColumnDefinition>, ToolError> {
        let set = self
            .executor
            .fetch(
                "SELECT column_name AS column_name, column_type AS column_type, \
                 is_nullable AS is_nullable, column_default AS column_default, \
                 column_key AS column_key, extra AS extra \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                &[self.database.as_str().into(), table.as_str().into()],
                self.max_rows as usize,
            )
            .await?;

        if set.rows.is_empty() {
            return Err(self.no_such_table(table));
        }

        let columns = set
            .rows
            .iter()
            .map(|row| ColumnDefinition {
                name: as_text(set.get(row, "column_name")).unwrap_or_default(),
                column_type: as_text(set.get(row, "column_type")).unwrap_or_default(),
                nullable: as_text(set.get(row, "is_nullable")).as_deref() == Some("YES"),
                default: as_text(set.get(row, "column_default")),
                key: as_text(set.get(row, "column_key")).unwrap_or_default(),
                extra: as_text(set.get(row, "extra")).unwrap_or_default(),
            })
            .collect();
        Ok(columns)
    }

    /// A page of rows. `limit` is clamped to the configured ceiling; both limit and
    /// offset are bound as parameters.
    pub async fn get_table_data(
        &self,
        table: &Identifier,
        limit: u64,
        offset: u64,
    ) -> Result<TablePage, ToolError> {
        let limit = limit.min(self.max_rows);
        let sql = format!(
            "SELECT * FROM {}.{} LIMIT ? OFFSET ?",
            self.database.quoted(),
            table.quoted()
        );
        let rows = self
            .executor
            .fetch(&sql, &[SqlValue::UInt(limit), SqlValue::UInt(offset)], limit as usize)
            .await?;
        Ok(TablePage { rows, limit, offset })
    }

    /// Indexes of `table`, columns ordered by their position inside each index.
    pub async fn show_indexes_table(&self, table: &Identifier) -> Result<Vec<IndexDefinition>, ToolError> {
        let sql = format!("SHOW INDEX FROM {} FROM {}", table.quoted(), self.database.quoted());
        let set = self.executor.fetch(&sql, &[], self.max_rows as usize).await?;

        // Key_name -> (position in output, definition, (seq, column) pairs)
        let mut order: Vec<String> = Vec::new();
        let mut indexes: BTreeMap<String, (IndexDefinition, Vec<(u64, String)>)> = BTreeMap::new();
        for row in &set.rows {
            let Some(name) = as_text(set.get(row, "Key_name")) else {
                continue;
            };
            let seq = as_u64(set.get(row, "Seq_in_index")).unwrap_or(0);
            let column = as_text(set.get(row, "Column_name"))
                .or_else(|| as_text(set.get(row, "Expression")))
                .unwrap_or_default();
            let entry = indexes.entry(name.clone()).or_insert_with(|| {
                order.push(name.clone());
                (
                    IndexDefinition {
                        name: name.clone(),
                        columns: Vec::new(),
                        unique: as_u64(set.get(row, "Non_unique")) == Some(0),
                        index_type: as_text(set.get(row, "Index_type")).unwrap_or_default(),
                        cardinality: as_u64(set.get(row, "Cardinality")),
                    },
                    Vec::new(),
                )
            });
            entry.1.push((seq, column));
        }

        Ok(order
            .into_iter()
            .filter_map(|name| indexes.remove(&name))
            .map(|(mut index, mut columns)| {
                columns.sort_by_key(|(seq, _)| *seq);
                index.columns = columns.into_iter().map(|(_, c)| c).collect();
                index
            })
            .collect())
    }

    /// Passes an already-checked SELECT to the engine's EXPLAIN.
    pub async fn show_explain_query(&self, statement: &CheckedStatement) -> Result<RowSet, ToolError> {
        let sql = format!("EXPLAIN {}", statement.sql);
        self.executor.fetch(&sql, &[], self.max_rows as usize).await
    }

    fn no_such_table(&self, table: &Identifier) -> ToolError {
        ToolError::QueryError {
            code: Some(ER_NO_SUCH_TABLE.into()),
            message: format!("Table '{}.{}' doesn't exist", self.database, table),
        }
    }
}
