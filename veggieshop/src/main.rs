use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use veggieshop::Server;
use veggieshop_admin::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1);
    let config = AppConfig::load(config_path.as_deref()).map_err(|e| format!("{e:?}"))?;
    veggieshop_admin::init_logging(&config.log);

    let addr: SocketAddr = std::env::var("VEGGIESHOP_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse()?;

    let server = Server::build(config).await.map_err(|e| format!("{e:?}"))?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target: "veggieshop", "shutdown signal received");
        shutdown.cancel();
    });

    let routes = axum::Router::<veggieshop_http::AppState>::new();
    server.run(routes, addr, cancel).await.map_err(|e| format!("{e:?}"))?;
    Ok(())
}
