use clap::Parser;
use mysql_tool_server::config::Config;
use mysql_tool_server::server;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries the protocol in stdio mode.
    env_logger::init();

    let config = Config::parse();
    server::run(config).await
}
