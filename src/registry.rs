//! Tool catalog: names, typed parameters and the operation each tool maps to.
//!
//! The catalog is built once at startup and never mutated. Argument validation
//! happens here, before any SQL is built or any connection is leased.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::error::ToolError;
use crate::identifier::Identifier;

/// Which operation a tool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    HealthCheck,
    ListTables,
    GetTableSchema,
    GetTableData,
    ExecuteQuery,
    ShowIndexesTable,
    ShowExplainQuery,
}

/// Parameter type for tool inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    /// Table or column name restricted to the identifier allow-list.
    Identifier,
    /// Free-form SQL text, classified later by the statement checker.
    Sql,
    /// Whole number with an inclusive lower bound.
    Integer { min: i64 },
}

impl ParamType {
    fn json_type(&self) -> &'static str {
        match self {
            ParamType::Identifier | ParamType::Sql => "string",
            ParamType::Integer { .. } => "integer",
        }
    }

    /// Validate a JSON value against this parameter type.
    fn validate(&self, name: &str, value: &Value) -> Result<ArgValue, ToolError> {
        match self {
            ParamType::Identifier => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ToolError::invalid_argument(name, format!("expected string, got {}", value_type_name(value))))?;
                Ok(ArgValue::Identifier(Identifier::parse(name, s)?))
            }
            ParamType::Sql => {
                let s = value
                    .as_str()
                    .ok_or_else(|| ToolError::invalid_argument(name, format!("expected string, got {}", value_type_name(value))))?;
                if s.trim().is_empty() {
                    return Err(ToolError::invalid_argument(name, "must not be empty"));
                }
                Ok(ArgValue::Text(s.to_string()))
            }
            ParamType::Integer { min } => {
                let n = value
                    .as_i64()
                    .ok_or_else(|| ToolError::invalid_argument(name, format!("expected integer, got {}", value_type_name(value))))?;
                if n < *min {
                    return Err(ToolError::invalid_argument(name, format!("must be at least {min}")));
                }
                Ok(ArgValue::Integer(n))
            }
        }
    }
}

fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Identifier(Identifier),
    Text(String),
    Integer(i64),
}

/// Arguments that passed validation, keyed by parameter name.
#[derive(Debug, Default)]
pub struct ToolArgs {
    values: HashMap<&'static str, ArgValue>,
}

impl ToolArgs {
    pub fn identifier(&self, name: &str) -> Result<&Identifier, ToolError> {
        match self.values.get(name) {
            Some(ArgValue::Identifier(id)) => Ok(id),
            _ => Err(ToolError::invalid_argument(name, "missing identifier")),
        }
    }

    pub fn text(&self, name: &str) -> Result<&str, ToolError> {
        match self.values.get(name) {
            Some(ArgValue::Text(s)) => Ok(s),
            _ => Err(ToolError::invalid_argument(name, "missing text")),
        }
    }

    pub fn integer(&self, name: &str) -> Result<i64, ToolError> {
        match self.values.get(name) {
            Some(ArgValue::Integer(n)) => Ok(*n),
            _ => Err(ToolError::invalid_argument(name, "missing integer")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub kind: ToolKind,
}

impl ToolDefinition {
    /// Checks every declared parameter and rejects undeclared ones.
    pub fn validate(&self, arguments: &Value) -> Result<ToolArgs, ToolError> {
        let empty = Map::new();
        let provided = match arguments {
            Value::Null => &empty,
            Value::Object(map) => map,
            other => {
                return Err(ToolError::invalid_argument(
                    "arguments",
                    format!("expected object, got {}", value_type_name(other)),
                ))
            }
        };

        if let Some(unknown) = provided
            .keys()
            .find(|key| !self.params.iter().any(|p| p.name == key.as_str()))
        {
            return Err(ToolError::invalid_argument(
                unknown.as_str(),
                format!("not a parameter of {}", self.name),
            ));
        }

        let mut args = ToolArgs::default();
        for spec in &self.params {
            let value = match (provided.get(spec.name), spec.default) {
                (Some(Value::Null) | None, Some(default)) => ArgValue::Integer(default),
                (Some(Value::Null) | None, None) if spec.required => {
                    return Err(ToolError::invalid_argument(spec.name, "is required"))
                }
                (Some(Value::Null) | None, None) => continue,
                (Some(value), _) => spec.param_type.validate(spec.name, value)?,
            };
            args.values.insert(spec.name, value);
        }
        Ok(args)
    }

    /// JSON Schema advertised in `tools/list`.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        for spec in &self.params {
            let mut property = json!({
                "type": spec.param_type.json_type(),
                "description": spec.description,
            });
            match &spec.param_type {
                ParamType::Identifier => {
                    property["pattern"] = json!("^[A-Za-z0-9_]{1,64}$");
                }
                ParamType::Integer { min } => {
                    property["minimum"] = json!(min);
                }
                ParamType::Sql => {}
            }
            if let Some(default) = spec.default {
                property["default"] = json!(default);
            }
            properties.insert(spec.name.to_string(), property);
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// Limits that shape the advertised parameters.
#[derive(Debug, Clone, Copy)]
pub struct CatalogLimits {
    pub default_page_size: u64,
    pub max_rows: u64,
    pub allow_writes: bool,
}

fn table_param(description: &'static str) -> ParamSpec {
    ParamSpec {
        name: "table",
        description,
        param_type: ParamType::Identifier,
        required: true,
        default: None,
    }
}

fn sql_param(description: &'static str) -> ParamSpec {
    ParamSpec {
        name: "sql",
        description,
        param_type: ParamType::Sql,
        required: true,
        default: None,
    }
}

/// The fixed set of tools.
#[derive(Debug)]
pub struct Registry {
    tools: Vec<ToolDefinition>,
}

impl Registry {
    pub fn new(limits: CatalogLimits) -> Self {
        let tools = vec![
            ToolDefinition {
                name: "health_check",
                description: "Check database connectivity and report connection pool health".into(),
                params: vec![],
                kind: ToolKind::HealthCheck,
            },
            ToolDefinition {
                name: "list_tables",
                description: "List all tables in the database".into(),
                params: vec![],
                kind: ToolKind::ListTables,
            },
            ToolDefinition {
                name: "get_table_schema",
                description: "Get the column definitions of a table".into(),
                params: vec![table_param("Name of the table to inspect")],
                kind: ToolKind::GetTableSchema,
            },
            ToolDefinition {
                name: "get_table_data",
                description: format!(
                    "Read a page of rows from a table (at most {} rows per call)",
                    limits.max_rows
                ),
                params: vec![
                    table_param("Name of the table to read"),
                    ParamSpec {
                        name: "limit",
                        description: "Maximum number of rows to return; larger values are clamped",
                        param_type: ParamType::Integer { min: 1 },
                        required: false,
                        default: Some(limits.default_page_size as i64),
                    },
                    ParamSpec {
                        name: "offset",
                        description: "Number of rows to skip",
                        param_type: ParamType::Integer { min: 0 },
                        required: false,
                        default: Some(0),
                    },
                ],
                kind: ToolKind::GetTableData,
            },
            ToolDefinition {
                name: "execute_query",
                description: if limits.allow_writes {
                    "Execute a single SQL statement (read-only, or INSERT/UPDATE/DELETE)".into()
                } else {
                    "Execute a single read-only SQL statement".into()
                },
                params: vec![sql_param(if limits.allow_writes {
                    "A single SELECT, SHOW, DESCRIBE, EXPLAIN, INSERT, UPDATE or DELETE statement"
                } else {
                    "A single SELECT, SHOW, DESCRIBE or EXPLAIN statement"
                })],
                kind: ToolKind::ExecuteQuery,
            },
            ToolDefinition {
                name: "show_indexes_table",
                description: "Show the indexes of a table".into(),
                params: vec![table_param("Name of the table whose indexes to show")],
                kind: ToolKind::ShowIndexesTable,
            },
            ToolDefinition {
                name: "show_explain_query",
                description: "Show the execution plan of a SELECT statement".into(),
                params: vec![sql_param("A single SELECT statement to explain")],
                kind: ToolKind::ShowExplainQuery,
            },
        ];
        Registry { tools }
    }

    pub fn get(&self, name: &str) -> Result<&ToolDefinition, ToolError> {
        self.tools
            .iter()
            .find(|tool| tool.name == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))
    }

    pub fn tools(&self) -> &[ToolDefinition] {
        &self.tools
    }
}
