#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;
use uuid::Uuid;

use ssh_fleet_mcp::mcp::config::{
    DEBUG_ENV_VAR, GLOBAL_ENV_VAR, SESSION_KEY_HEADER, resolve_bool, resolve_key_dir,
    resolve_mode, resolve_port,
};
use ssh_fleet_mcp::mcp::keys::KeyStore;
use ssh_fleet_mcp::mcp::{GatewayTools, Pool, Tenant};

/// MCP gateway for driving fleets of remote hosts over persistent SSH
/// connections.
#[derive(Parser)]
#[command(name = "ssh-fleet-mcp", version)]
struct Cli {
    /// Transport mode: stdio or http
    #[arg(long)]
    mode: Option<String>,

    /// HTTP server port (http mode only)
    #[arg(long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Use a single shared SSH manager for all sessions
    #[arg(long)]
    global: bool,

    /// Key directory (default: /data when present, else ./data)
    #[arg(long)]
    key_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    let mode = resolve_mode(cli.mode);
    let port = resolve_port(cli.port);
    let debug = resolve_bool(cli.debug, DEBUG_ENV_VAR);
    let global = resolve_bool(cli.global, GLOBAL_ENV_VAR);
    let key_dir = resolve_key_dir(cli.key_dir);

    init_tracing(&mode, debug);
    info!(%mode, port, global, "starting ssh-fleet-mcp");

    // An unusable key directory is fatal before any transport binds.
    let key_store = Arc::new(KeyStore::new(key_dir.as_deref()));
    key_store.ensure()?;

    let pool = Pool::new(global, key_store);

    match mode.as_str() {
        "stdio" => run_stdio(pool).await,
        "http" => run_http(pool, port).await,
        other => Err(format!("unknown mode: '{}' (use 'stdio' or 'http')", other).into()),
    }
}

fn init_tracing(mode: &str, debug: bool) {
    let directive = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive.parse().expect("valid directive"));

    if mode == "stdio" {
        // Stdout carries the protocol in stdio mode.
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else if debug {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Serve a single client over stdin/stdout.
async fn run_stdio(pool: Arc<Pool>) -> Result<(), Box<dyn std::error::Error>> {
    let tenant = if pool.is_global() {
        Tenant::Global
    } else {
        // One implicit session for the lifetime of the process.
        Tenant::Session(Uuid::now_v7().to_string())
    };

    let tools = GatewayTools::new(pool.clone(), tenant);
    poem_mcpserver::stdio::stdio(McpServer::new().tools(tools)).await?;

    pool.close().await;
    Ok(())
}

/// Serve streamable HTTP on `/mcp` with graceful shutdown on SIGINT.
async fn run_http(pool: Arc<Pool>, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", port);

    let endpoint_pool = pool.clone();
    let app = Route::new()
        .at(
            "/mcp",
            streamable_http::endpoint(move |req| {
                let tenant = tenant_from_request(&endpoint_pool, req);
                info!(%tenant, "session opened");
                McpServer::new().tools(GatewayTools::new(endpoint_pool.clone(), tenant))
            }),
        )
        .with(Tracing);

    info!("listening on {}/mcp", addr);
    Server::new(TcpListener::bind(addr))
        .name("ssh-fleet-mcp")
        .run_with_graceful_shutdown(app, shutdown_signal(), Some(Duration::from_secs(5)))
        .await?;

    pool.close().await;
    info!("server stopped");
    Ok(())
}

/// Resolve the tenant identity for a new MCP session.
///
/// The sticky-routing header wins when present; the generated session ID
/// then matters only for logging. Without the header each MCP session gets
/// its own isolated tenant.
fn tenant_from_request(pool: &Arc<Pool>, req: &poem::Request) -> Tenant {
    if pool.is_global() {
        return Tenant::Global;
    }
    match req.header(SESSION_KEY_HEADER) {
        Some(key) if !key.is_empty() => Tenant::Header(key.to_string()),
        _ => Tenant::Session(Uuid::now_v7().to_string()),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining");
}
