use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use serde_json::{json, Value};
use sqlx::mysql::types::MySqlTime;
use sqlx::mysql::{MySqlArguments, MySqlColumn, MySqlConnectOptions, MySqlRow};
use sqlx::query::Query;
use sqlx::{
    Column, ConnectOptions, Connection, Executor, MySql, MySqlConnection, Row, Statement, TypeInfo,
};

use crate::config::Config;
use crate::error::DriverError;
use crate::pool::{Connector, DbConnection};
use crate::value::{ColumnMeta, RowSet, SqlValue};

/// Opens single MySQL connections from the configured credentials.
pub struct MySqlConnector {
    options: MySqlConnectOptions,
}

impl MySqlConnector {
    pub fn new(config: &Config) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            // Statements are logged by the executor with their bound parameters instead.
            .disable_statement_logging();
        MySqlConnector { options }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(&self) -> Result<Box<dyn DbConnection>, DriverError> {
        let conn = self
            .options
            .connect()
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        debug!("Opened MySQL connection");
        Ok(Box::new(MySqlHandle { conn }))
    }
}

struct MySqlHandle {
    conn: MySqlConnection,
}

fn bind_all<'q>(sql: &'q str, params: &'q [SqlValue]) -> Query<'q, MySql, MySqlArguments> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        SqlValue::UInt(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    })
}

impl MySqlHandle {
    /// Column metadata for a statement that produced no rows, taken from its prepared form.
    async fn describe_columns(&mut self, sql: &str) -> Vec<ColumnMeta> {
        match Executor::prepare(&mut self.conn, sql).await {
            Ok(statement) => column_meta(statement.columns()),
            Err(e) => {
                debug!("No column metadata for empty result: {e}");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl DbConnection for MySqlHandle {
    async fn fetch(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        max_rows: usize,
    ) -> Result<RowSet, DriverError> {
        let mut set = RowSet::default();
        {
            // Parameterless statements use the text protocol, which also accepts the
            // SHOW and EXPLAIN forms the prepared-statement protocol refuses.
            let mut stream = if params.is_empty() {
                sqlx::raw_sql(sql).fetch(&mut self.conn)
            } else {
                bind_all(sql, params).fetch(&mut self.conn)
            };
            while let Some(row) = stream.try_next().await? {
                if set.columns.is_empty() {
                    set.columns = column_meta(row.columns());
                }
                if set.rows.len() == max_rows {
                    set.truncated = true;
                    break;
                }
                set.rows.push(decode_row(&row));
            }
        }
        if set.columns.is_empty() {
            set.columns = self.describe_columns(sql).await;
        }
        Ok(set)
    }

    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DriverError> {
        let result = bind_all(sql, params).execute(&mut self.conn).await?;
        Ok(result.rows_affected())
    }

    async fn ping(&mut self) -> Result<(), DriverError> {
        self.conn
            .ping()
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))
    }

    async fn close(self: Box<Self>) {
        if let Err(e) = self.conn.close().await {
            debug!("Error while closing MySQL connection: {e}");
        }
    }
}

fn column_meta(columns: &[MySqlColumn]) -> Vec<ColumnMeta> {
    columns
        .iter()
        .map(|column| ColumnMeta {
            name: column.name().to_string(),
            type_name: column.type_info().name().to_string(),
        })
        .collect()
}

fn decode_row(row: &MySqlRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| decode_value(row, i, column_decoder(column.type_info().name())))
        .collect()
}

/// How a column's values are read, chosen from the engine's type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Null,
    Bool,
    Int,
    UInt,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Timestamp,
    Text,
}

fn column_decoder(type_name: &str) -> Decoder {
    match type_name {
        "NULL" => Decoder::Null,
        "BOOLEAN" => Decoder::Bool,
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "INTEGER" | "BIGINT" => Decoder::Int,
        // YEAR is sent with the unsigned flag.
        "YEAR" => Decoder::UInt,
        t if t.ends_with("UNSIGNED") => Decoder::UInt,
        "FLOAT" => Decoder::Float,
        "DOUBLE" | "REAL" => Decoder::Double,
        "DECIMAL" | "NUMERIC" => Decoder::Decimal,
        "DATE" => Decoder::Date,
        "TIME" => Decoder::Time,
        "DATETIME" => Decoder::DateTime,
        "TIMESTAMP" => Decoder::Timestamp,
        _ => Decoder::Text,
    }
}

/// Reads column `i` with `decoder`. A value the typed decode rejects falls back to its raw text.
fn decode_value(row: &MySqlRow, i: usize, decoder: Decoder) -> Value {
    let typed: Result<Option<Value>, sqlx::Error> = match decoder {
        Decoder::Null => return Value::Null,
        Decoder::Text => return decode_text(row, i),
        Decoder::Bool => row.try_get::<Option<bool>, _>(i).map(|v| v.map(Value::from)),
        Decoder::Int => row.try_get::<Option<i64>, _>(i).map(|v| v.map(Value::from)),
        Decoder::UInt => row.try_get::<Option<u64>, _>(i).map(|v| v.map(Value::from)),
        Decoder::Float => row.try_get::<Option<f32>, _>(i).map(|v| v.map(float_value)),
        Decoder::Double => row.try_get::<Option<f64>, _>(i).map(|v| v.map(Value::from)),
        // Decimals travel as strings to keep their precision.
        Decoder::Decimal => row
            .try_get::<Option<bigdecimal::BigDecimal>, _>(i)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        Decoder::Date => row
            .try_get::<Option<chrono::NaiveDate>, _>(i)
            .map(|v| v.map(|d| Value::String(d.to_string()))),
        // TIME is an interval in MySQL and may be negative or exceed 24 hours.
        Decoder::Time => row
            .try_get::<Option<MySqlTime>, _>(i)
            .map(|v| v.map(|t| Value::String(t.to_string()))),
        Decoder::DateTime => row.try_get::<Option<chrono::NaiveDateTime>, _>(i).map(|v| {
            v.map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
        }),
        Decoder::Timestamp => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i)
            .map(|v| v.map(|dt| Value::String(dt.to_rfc3339()))),
    };
    match typed {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(e) => {
            debug!("Typed decode of column {i} as {decoder:?} failed, using raw text: {e}");
            decode_text(row, i)
        }
    }
}

/// Widens a FLOAT through its shortest decimal form, so 0.1 stays 0.1 rather than
/// picking up single-precision noise.
fn float_value(v: f32) -> Value {
    v.to_string()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Fallback for VARCHAR, TEXT, BLOB, JSON, ENUM and the binary-collated strings
/// information_schema returns on some servers.
fn decode_text(row: &MySqlRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return json!(v);
    }
    match row.try_get_unchecked::<Option<Vec<u8>>, _>(i) {
        Ok(v) => json!(v.map(|bytes| String::from_utf8_lossy(&bytes).into_owned())),
        Err(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_decoders() {
        assert_eq!(column_decoder("INT"), Decoder::Int);
        assert_eq!(column_decoder("BIGINT"), Decoder::Int);
        assert_eq!(column_decoder("INT UNSIGNED"), Decoder::UInt);
        assert_eq!(column_decoder("BIGINT UNSIGNED"), Decoder::UInt);
    }

    #[test]
    fn test_year_decodes_unsigned() {
        assert_eq!(column_decoder("YEAR"), Decoder::UInt);
    }

    #[test]
    fn test_temporal_and_numeric_decoders() {
        assert_eq!(column_decoder("TIME"), Decoder::Time);
        assert_eq!(column_decoder("DATETIME"), Decoder::DateTime);
        assert_eq!(column_decoder("TIMESTAMP"), Decoder::Timestamp);
        assert_eq!(column_decoder("FLOAT"), Decoder::Float);
        assert_eq!(column_decoder("DOUBLE"), Decoder::Double);
        assert_eq!(column_decoder("DECIMAL"), Decoder::Decimal);
    }

    #[test]
    fn test_everything_else_is_text() {
        for name in ["VARCHAR", "TEXT", "BLOB", "JSON", "ENUM", "VARBINARY"] {
            assert_eq!(column_decoder(name), Decoder::Text, "{name}");
        }
    }

    #[test]
    fn test_float_keeps_short_form() {
        assert_eq!(float_value(0.1), json!(0.1));
        assert_eq!(float_value(-2.5), json!(-2.5));
        assert_eq!(float_value(f32::NAN), Value::Null);
    }
}
