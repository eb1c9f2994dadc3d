use log::{debug, info, warn};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

use crate::error::ToolError;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::introspect::Introspector;
use crate::registry::{Registry, ToolDefinition, ToolKind};
use crate::statement::{check_query, check_select, CheckedStatement, StatementKind};
use crate::value::QueryResult;

/// Lifecycle of one tool call, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Received,
    Validated,
    Executing,
    Completed,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallState::Received => "received",
            CallState::Validated => "validated",
            CallState::Executing => "executing",
            CallState::Completed => "completed",
            CallState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A fully validated call. Building one never touches the database.
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    HealthCheck,
    ListTables,
    TableSchema(Identifier),
    TableData { table: Identifier, limit: u64, offset: u64 },
    Query(CheckedStatement),
    Indexes(Identifier),
    Explain(CheckedStatement),
}

/// Routes tool calls to the executor and introspector.
pub struct Dispatcher {
    registry: Arc<Registry>,
    executor: Executor,
    introspector: Introspector,
    allow_writes: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, executor: Executor, introspector: Introspector, allow_writes: bool) -> Self {
        Dispatcher {
            registry,
            executor,
            introspector,
            allow_writes,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs one tool call to completion. The handler runs at most once and is never retried.
    pub async fn call(&self, name: &str, arguments: &Value) -> Result<QueryResult, ToolError> {
        debug!("Tool call {name}: {}", CallState::Received);
        let result = match self.plan(name, arguments) {
            Ok(plan) => {
                debug!("Tool call {name}: {}", CallState::Validated);
                debug!("Tool call {name}: {}", CallState::Executing);
                self.run(plan).await
            }
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => info!("Tool call {name}: {}", CallState::Completed),
            Err(e) => warn!("Tool call {name}: {} ({})", CallState::Failed, e.kind()),
        }
        result
    }

    fn plan(&self, name: &str, arguments: &Value) -> Result<Plan, ToolError> {
        let tool: &ToolDefinition = self.registry.get(name)?;
        let args = tool.validate(arguments)?;
        let plan = match tool.kind {
            ToolKind::HealthCheck => Plan::HealthCheck,
            ToolKind::ListTables => Plan::ListTables,
            ToolKind::GetTableSchema => Plan::TableSchema(args.identifier("table")?.clone()),
            ToolKind::GetTableData => Plan::TableData {
                table: args.identifier("table")?.clone(),
                // Registry bounds keep both non-negative.
                limit: args.integer("limit")?.max(1) as u64,
                offset: args.integer("offset")?.max(0) as u64,
            },
            ToolKind::ExecuteQuery => Plan::Query(check_query(args.text("sql")?, self.allow_writes)?),
            ToolKind::ShowIndexesTable => Plan::Indexes(args.identifier("table")?.clone()),
            ToolKind::ShowExplainQuery => Plan::Explain(check_select(args.text("sql")?)?),
        };
        Ok(plan)
    }

    async fn run(&self, plan: Plan) -> Result<QueryResult, ToolError> {
        match plan {
            Plan::HealthCheck => Ok(self.health_check().await),
            Plan::ListTables => {
                let list = self.introspector.list_tables().await?;
                Ok(QueryResult::Status(json!(list)))
            }
            Plan::TableSchema(table) => {
                let columns = self.introspector.get_table_schema(&table).await?;
                Ok(QueryResult::Status(json!({ "table": table.as_str(), "columns": columns })))
            }
            Plan::TableData { table, limit, offset } => {
                let page = self.introspector.get_table_data(&table, limit, offset).await?;
                let mut value = QueryResult::Table(page.rows).to_json();
                value["limit"] = json!(page.limit);
                value["offset"] = json!(page.offset);
                Ok(QueryResult::Status(value))
            }
            Plan::Query(statement) => match statement.kind {
                StatementKind::Read => {
                    let rows = self
                        .executor
                        .fetch(&statement.sql, &[], self.introspector.max_rows() as usize)
                        .await?;
                    Ok(QueryResult::Table(rows))
                }
                StatementKind::Write => {
                    let affected = self.executor.execute(&statement.sql, &[]).await?;
                    Ok(QueryResult::Status(json!({ "rows_affected": affected })))
                }
            },
            Plan::Indexes(table) => {
                let indexes = self.introspector.show_indexes_table(&table).await?;
                Ok(QueryResult::Status(json!({ "table": table.as_str(), "indexes": indexes })))
            }
            Plan::Explain(statement) => {
                Ok(QueryResult::Table(self.introspector.show_explain_query(&statement).await?))
            }
        }
    }

    /// Leases a connection for a trivial round trip. An unreachable database is part of
    /// the report rather than a failed call.
    async fn health_check(&self) -> QueryResult {
        let outcome = self.executor.round_trip().await;
        let pool = self.executor.pool().stats();
        match outcome {
            Ok(()) => QueryResult::Status(json!({
                "status": "healthy",
                "reachable": true,
                "pool": pool,
            })),
            Err(e) => {
                warn!("Health check failed: {e}");
                QueryResult::Status(json!({
                    "status": "unhealthy",
                    "reachable": false,
                    "pool": pool,
                    "error": e.to_record(),
                }))
            }
        }
    }
}
