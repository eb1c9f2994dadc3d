use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{redact_url, Config, Transport};
use crate::dispatch::Dispatcher;
use crate::error::ToolError;
use crate::executor::Executor;
use crate::identifier::Identifier;
use crate::introspect::Introspector;
use crate::mysql::MySqlConnector;
use crate::pool::Pool;
use crate::registry::{CatalogLimits, Registry};
use crate::rpc::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, ServerCapabilities, ServerInfo, Tool,
    ToolCallParams, ToolsCapability, ToolsList, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};

const PROTOCOL_VERSION: &str = "2025-03-26";
const MAX_RETRIES: u32 = 5;
const RETRY_DELAY_MS: u64 = 1000;

/// Wires pool, executor, introspector and catalog together.
pub fn build_dispatcher(config: &Config, pool: Pool) -> Result<Dispatcher, ToolError> {
    let executor = Executor::new(pool, config.acquire_timeout(), config.query_timeout());
    let database = Identifier::parse("database", &config.database)?;
    let introspector = Introspector::new(executor.clone(), database, config.max_rows);
    let registry = Registry::new(CatalogLimits {
        default_page_size: config.default_page_size,
        max_rows: config.max_rows,
        allow_writes: config.allow_dangerous_queries,
    });
    Ok(Dispatcher::new(
        Arc::new(registry),
        executor,
        introspector,
        config.allow_dangerous_queries,
    ))
}

/// Proves the credentials work before any tool call is accepted.
async fn connect_with_retry(executor: &Executor) -> Result<(), ToolError> {
    let mut retry_count = 0;
    loop {
        match executor.round_trip().await {
            Ok(()) => {
                info!("Successfully connected to MySQL database");
                return Ok(());
            }
            Err(e) => {
                retry_count += 1;
                if retry_count >= MAX_RETRIES {
                    error!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                    return Err(e);
                }
                warn!("Database connection failed (attempt {retry_count}/{MAX_RETRIES}): {e}");
                info!("Retrying in {RETRY_DELAY_MS}ms...");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    info!("Server config: {}", redact_url(&config.database_url()));
    info!(
        "Pool size {}, acquire timeout {:?}, query timeout {:?}, max rows {}, writes {}",
        config.pool_size,
        config.acquire_timeout(),
        config.query_timeout(),
        config.max_rows,
        if config.allow_dangerous_queries { "enabled" } else { "disabled" }
    );
    info!("Server PID: {}", std::process::id());

    let connector = Arc::new(MySqlConnector::new(&config));
    let pool = Pool::new(connector, config.pool_size, config.idle_check());
    let dispatcher = Arc::new(build_dispatcher(&config, pool.clone())?);
    connect_with_retry(&Executor::new(
        pool.clone(),
        config.acquire_timeout(),
        config.query_timeout(),
    ))
    .await?;

    let served = match config.transport {
        Transport::Stdio => {
            info!("Serving one session over stdio");
            tokio::select! {
                result = serve_session(tokio::io::stdin(), tokio::io::stdout(), dispatcher) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
        Transport::Tcp => serve_tcp(config.listen, dispatcher).await,
    };

    pool.shutdown().await;
    info!("MySQL tool server shutdown complete");
    served.map_err(Into::into)
}

/// Accepts sessions until interrupted.
async fn serve_tcp(addr: SocketAddr, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("MySQL tool server listening on {addr}");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, no longer accepting sessions");
                break;
            }
            accept = listener.accept() => {
                let (stream, peer) = match accept {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };
                info!("Session opened from {peer}");
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    let (reader, writer) = stream.into_split();
                    if let Err(e) = serve_session(reader, writer, dispatcher).await {
                        warn!("Session from {peer} ended with error: {e}");
                    }
                    info!("Session from {peer} closed");
                });
            }
        }
    }
    Ok(())
}

/// Serves one client: reads newline-delimited requests, runs each as its own task and
/// writes responses as they finish. When the client goes away, unfinished calls are
/// aborted and their connections discarded.
pub async fn serve_session<R, W>(reader: R, writer: W, dispatcher: Arc<Dispatcher>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
    let writer_task = tokio::spawn(write_responses(writer, rx));

    let mut lines = BufReader::new(reader).lines();
    let mut calls = JoinSet::new();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    debug!("Received message (len={}): {}", line.len(), line);
                    match decode_request(&line) {
                        Ok(request) => {
                            let dispatcher = dispatcher.clone();
                            let tx = tx.clone();
                            calls.spawn(async move {
                                let id = request.id.clone();
                                let response = AssertUnwindSafe(handle_request(request, &dispatcher))
                                    .catch_unwind()
                                    .await
                                    .unwrap_or_else(|_| {
                                        error!("Request handler panicked");
                                        Some(JsonRpcResponse::error(id, INTERNAL_ERROR, "Internal error".to_string()))
                                    });
                                if let Some(response) = response {
                                    // The writer only stops once the session is over.
                                    let _ = tx.send(response);
                                }
                            });
                        }
                        Err(response) => {
                            let _ = tx.send(response);
                        }
                    }
                }
                Ok(None) => {
                    info!("Client disconnected");
                    break;
                }
                Err(e) => {
                    warn!("Error reading from client: {e} (error kind: {:?})", e.kind());
                    break;
                }
            },
            Some(joined) = calls.join_next(), if !calls.is_empty() => {
                if let Err(e) = joined {
                    error!("Call task failed: {e}");
                }
            }
        }
    }

    if !calls.is_empty() {
        warn!("Abandoning {} in-flight calls", calls.len());
    }
    calls.shutdown().await;
    drop(tx);

    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

async fn write_responses<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize response: {e}");
                let fallback = JsonRpcResponse::error(response.id, INTERNAL_ERROR, "Internal error".to_string());
                match serde_json::to_string(&fallback) {
                    Ok(line) => line,
                    Err(_) => continue,
                }
            }
        };
        write_response(&mut writer, &line).await?;
    }
    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

fn decode_request(line: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).map_err(|e| {
        warn!("Failed to parse request: {e}");
        JsonRpcResponse::error(None, PARSE_ERROR, "Parse error".to_string())
    })?;
    let id = value.get("id").cloned();
    let request = serde_json::from_value::<JsonRpcRequest>(value).map_err(|e| {
        warn!("Malformed request: {e}");
        JsonRpcResponse::error(id.clone(), INVALID_REQUEST, format!("Invalid request: {e}"))
    })?;
    if !request.is_version_2() {
        return Err(JsonRpcResponse::error(
            id,
            INVALID_REQUEST,
            format!("Unsupported jsonrpc version '{}'", request.jsonrpc),
        ));
    }
    Ok(request)
}

/// Produces the response for one request, or `None` for notifications.
pub async fn handle_request(request: JsonRpcRequest, dispatcher: &Dispatcher) -> Option<JsonRpcResponse> {
    debug!("Parsed request: method={}, id={:?}", request.method, request.id);
    if request.method.starts_with("notifications/") || request.method == "initialized" {
        debug!("Received notification: {}", request.method);
        return None;
    }

    let notification = request.is_notification();
    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            request.id,
            json!(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities {
                    tools: Some(ToolsCapability { list_changed: false }),
                },
                server_info: ServerInfo {
                    name: env!("CARGO_PKG_NAME").to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            }),
        ),
        "ping" => JsonRpcResponse::success(request.id, json!({})),
        "tools/list" => {
            let tools = dispatcher
                .registry()
                .tools()
                .iter()
                .map(|tool| Tool {
                    name: tool.name.to_string(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema(),
                })
                .collect();
            JsonRpcResponse::success(request.id, json!(ToolsList { tools }))
        }
        "tools/call" => call_tool(request.id, request.params, dispatcher).await,
        _ => {
            warn!("Unknown method: {}", request.method);
            JsonRpcResponse::error(request.id, METHOD_NOT_FOUND, format!("Method not found: {}", request.method))
        }
    };

    if notification {
        None
    } else {
        Some(response)
    }
}

async fn call_tool(id: Option<Value>, params: Option<Value>, dispatcher: &Dispatcher) -> JsonRpcResponse {
    let Some(params) = params else {
        return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing parameters".to_string());
    };
    let params = match serde_json::from_value::<ToolCallParams>(params) {
        Ok(params) => params,
        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid tool call parameters: {e}")),
    };

    match dispatcher.call(&params.name, &params.arguments).await {
        Ok(result) => {
            let payload = result.to_json();
            let mut text = result.summary();
            text.push_str("\n\n");
            text.push_str(&serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "Error formatting results".to_string()));
            JsonRpcResponse::success(
                id,
                json!({
                    "content": [{
                        "type": "text",
                        "text": text
                    }],
                    "structuredContent": payload
                }),
            )
        }
        Err(e) => JsonRpcResponse::tool_error(id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{rows, FakeConnector, Reply, Script};
    use clap::Parser;

    fn dispatcher(script: Script) -> (Arc<Dispatcher>, Arc<FakeConnector>, Pool) {
        let config = Config::try_parse_from(["mysql-tool-server", "--user", "app", "--database", "shop"]).unwrap();
        let connector = Arc::new(FakeConnector::new(script));
        let pool = Pool::new(connector.clone(), 2, config.idle_check());
        (Arc::new(build_dispatcher(&config, pool.clone()).unwrap()), connector, pool)
    }

    fn request(line: &str) -> JsonRpcRequest {
        serde_json::from_str(line).unwrap()
    }

    #[tokio::test]
    async fn test_initialize() {
        let (d, _, _) = dispatcher(Script::default());
        let response = handle_request(request(r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#), &d)
            .await
            .unwrap();
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(value["result"]["serverInfo"]["name"], "mysql-tool-server");
    }

    #[tokio::test]
    async fn test_tools_list() {
        let (d, _, _) = dispatcher(Script::default());
        let response = handle_request(request(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#), &d)
            .await
            .unwrap();
        let value = serde_json::to_value(response).unwrap();
        let names: Vec<&str> = value["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "health_check",
                "list_tables",
                "get_table_schema",
                "get_table_data",
                "execute_query",
                "show_indexes_table",
                "show_explain_query"
            ]
        );
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let (d, _, _) = dispatcher(Script::default());
        let response = handle_request(request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#), &d).await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (d, _, _) = dispatcher(Script::default());
        let response = handle_request(request(r#"{"jsonrpc":"2.0","id":3,"method":"resources/list"}"#), &d)
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tool_call_result_shape() {
        let script = Script::default().on(
            "SELECT table_name",
            Reply::Rows(rows(&["table_name"], vec![vec![json!("orders")]])),
        );
        let (d, _, _) = dispatcher(script);
        let response = handle_request(
            request(r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"list_tables","arguments":{}}}"#),
            &d,
        )
        .await
        .unwrap();
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value["result"]["structuredContent"]["tables"], json!(["orders"]));
        assert_eq!(value["result"]["structuredContent"]["truncated"], false);
        assert_eq!(value["result"]["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn test_tool_call_error_is_structured() {
        let (d, connector, _) = dispatcher(Script::default());
        let response = handle_request(
            request(r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"get_table_schema","arguments":{"table":"users; DROP TABLE x"}}}"#),
            &d,
        )
        .await
        .unwrap();
        let error = response.error.unwrap();
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.data.unwrap()["kind"], "InvalidArgument");
        assert_eq!(connector.opened(), 0);
    }

    #[test]
    fn test_decode_rejects_bad_envelopes() {
        let err = decode_request("{not json").unwrap_err();
        assert_eq!(err.error.unwrap().code, PARSE_ERROR);

        let err = decode_request(r#"{"jsonrpc":"1.0","id":9,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.id, Some(json!(9)));
        assert_eq!(err.error.unwrap().code, INVALID_REQUEST);

        let err = decode_request(r#"{"jsonrpc":"2.0","id":10}"#).unwrap_err();
        assert_eq!(err.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_session_answers_out_of_order() {
        let script = Script::default()
            .on("SELECT table_name", Reply::Rows(rows(&["table_name"], vec![vec![json!("orders")]])))
            .with_delay(Duration::from_millis(150));
        let (d, _, _) = dispatcher(script);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(serve_session(server_read, server_write, d));

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"list_tables\"}}\n")
            .await
            .unwrap();
        client_write
            .write_all(b"not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let line = lines.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            if value["error"]["code"] == PARSE_ERROR {
                ids.push(Value::Null);
            } else {
                ids.push(value["id"].clone());
            }
        }
        // The slow tool call finishes last.
        assert_eq!(ids.last().unwrap(), &json!(1));
        assert!(ids.contains(&json!(2)));

        client_write.shutdown().await.unwrap();
        session.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_abandons_in_flight_calls() {
        let script = Script::default().with_delay(Duration::from_secs(5));
        let (d, _, pool) = dispatcher(script);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let session = tokio::spawn(serve_session(server_read, server_write, d));

        let (_client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"list_tables\"}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().leased, 1);

        client_write.shutdown().await.unwrap();
        session.await.unwrap().unwrap();
        let stats = pool.stats();
        assert_eq!((stats.leased, stats.idle, stats.closed), (0, 0, 2));
    }
}
