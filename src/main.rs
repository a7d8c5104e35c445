use anyhow::Result;
use clap::Parser;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{info, warn};

mod api;
mod config;
mod errors;
mod output;
mod registry;
mod transcoder;
mod ws;

use api::AppState;
use config::Config;

#[derive(Parser, Debug)]
#[command(name = "rtsp-relay-server", about = "RTSP to HLS/fMP4 relay server")]
struct Args {
    /// Path to the configuration file (TOML or JSON)
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtsp_relay_server=debug,info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config).unwrap_or_else(|_| {
        warn!("Could not load {}, using default configuration", args.config);
        Config::default()
    });

    info!(
        "Starting RTSP relay server on {}:{} (output format: {})",
        config.server.host, config.server.port, config.transcoder.output_format
    );

    // The static file service needs the output root to exist up front
    std::fs::create_dir_all(&config.transcoder.output_dir)?;

    let state = AppState::new(config.clone());

    // Every active transcoder is torn down through the same remove/kill/
    // cleanup path before the process exits
    let shutdown_state = state.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping all streams...");
            api::shutdown_all(&shutdown_state).await;
            std::process::exit(0);
        }
    });

    let cors_layer = if let Some(origin) = &config.server.cors_allow_origin {
        if origin == "*" {
            tower_http::cors::CorsLayer::permissive()
        } else {
            match origin.parse::<axum::http::HeaderValue>() {
                Ok(origin_header) => tower_http::cors::CorsLayer::new()
                    .allow_origin(origin_header)
                    .allow_methods(tower_http::cors::Any)
                    .allow_headers(tower_http::cors::Any),
                Err(_) => {
                    warn!("Invalid CORS origin '{}', falling back to permissive", origin);
                    tower_http::cors::CorsLayer::permissive()
                }
            }
        }
    } else {
        tower_http::cors::CorsLayer::permissive()
    };

    let app = axum::Router::new()
        .route(
            "/api/start-stream/:stream_id",
            axum::routing::get(api::start_stream_handler),
        )
        .route(
            "/api/stop-stream/:stream_id",
            axum::routing::get(api::stop_stream_handler),
        )
        .route(
            "/api/stream-status/:stream_id",
            axum::routing::get(api::stream_status_handler),
        )
        .route("/api/streams", axum::routing::get(api::list_streams_handler))
        .route("/health", axum::routing::get(api::health_handler))
        .route("/ws", axum::routing::get(ws::ws_handler))
        .nest_service(
            output::STATIC_PREFIX,
            tower_http::services::ServeDir::new(&config.transcoder.output_dir),
        )
        .layer(cors_layer)
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);

    if let Some(tls_config) = &config.server.tls {
        if tls_config.enabled {
            info!("Starting HTTPS server on {}", addr);
            start_https_server(app, &addr, tls_config).await?;
        } else {
            info!("Starting HTTP server on {}", addr);
            start_http_server(app, &addr).await?;
        }
    } else {
        info!("Starting HTTP server on {}", addr);
        start_http_server(app, &addr).await?;
    }

    Ok(())
}

async fn start_http_server(app: axum::Router, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn start_https_server(
    app: axum::Router,
    addr: &str,
    tls_cfg: &config::TlsConfig,
) -> Result<()> {
    let cert_file = File::open(&tls_cfg.cert_path).map_err(|e| {
        anyhow::anyhow!("Failed to open certificate file '{}': {}", tls_cfg.cert_path, e)
    })?;
    let key_file = File::open(&tls_cfg.key_path).map_err(|e| {
        anyhow::anyhow!("Failed to open private key file '{}': {}", tls_cfg.key_path, e)
    })?;

    let mut cert_reader = BufReader::new(cert_file);
    let mut key_reader = BufReader::new(key_file);

    let certs = rustls_pemfile::certs(&mut cert_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse certificate: {}", e))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

    if keys.is_empty() {
        let mut key_reader = BufReader::new(File::open(&tls_cfg.key_path)?);
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .map_err(|e| anyhow::anyhow!("Failed to parse RSA private key: {}", e))?;
    }

    let private_key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("No private key found in key file"))?;

    let rustls_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(private_key))
        .map_err(|e| anyhow::anyhow!("Failed to create TLS config: {}", e))?;

    info!("HTTPS server listening on https://{}", addr);

    let tls_config = axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(rustls_config));
    axum_server::bind_rustls(addr.parse()?, tls_config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;

    Ok(())
}
