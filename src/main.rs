mod codec;
mod config;
mod core;
mod cover_engine;
mod error;
mod model;
mod mqtt_bridge;
mod opcodes;
mod realtime;
mod registry;
mod scheduler;
mod sensors;
mod store;
mod transport;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::core::{run_mqtt_command_loop, run_udp_dispatch_loop, Core};

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "buspro_bridge=info,rumqttc=warn".into()),
        )
        .init();

    let config = config::Config::load();
    info!("buspro-bridge v{} starting — gateway {}:{}", env!("CARGO_PKG_VERSION"), config.gateway_host, config.gateway_port);

    let http_bind = config.http_bind.clone();

    let (core, udp_rx, mqtt_rx) = match Core::new(config).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!("failed to start: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(run_udp_dispatch_loop(core.clone(), udp_rx));
    tokio::spawn(run_mqtt_command_loop(core.clone(), mqtt_rx));
    tokio::spawn(core.clone().run_cover_ticker());
    tokio::spawn(core.clone().run_status_poller());

    let cors_origins_env = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins_env
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(realtime::ws_handler))
        .layer(cors)
        .with_state(core);

    let listener = match tokio::net::TcpListener::bind(&http_bind).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {http_bind}: {e}");
            std::process::exit(1);
        }
    };
    info!("listening on {http_bind}");
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
    }
}
