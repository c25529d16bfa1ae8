//! # Nurse Voice Backend - Main Application Entry Point
//!
//! Runs the voice session core behind a small actix-web control surface.
//!
//! ## What main does:
//! 1. **Loads configuration** from defaults, `config.toml` and the environment
//! 2. **Sets up logging** with `tracing`
//! 3. **Builds the session controller** with the WAV device backend and the Gemini connector
//! 4. **Serves the HTTP API** until SIGINT or SIGTERM
//! 5. **Stops the live session** so devices are released and the recording is written
//!
//! `--print-config` prints the default configuration as TOML and exits.

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use nurse_voice_backend::audio::wav::WavBackend;
use nurse_voice_backend::config::AppConfig;
use nurse_voice_backend::protocol::gemini::GeminiConnector;
use nurse_voice_backend::session::{SessionController, ToolRegistry};
use nurse_voice_backend::state::AppState;
use nurse_voice_backend::{handlers, health};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    if std::env::args().any(|arg| arg == "--print-config") {
        print!("{}", toml::to_string_pretty(&AppConfig::default())?);
        return Ok(());
    }

    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if config.service.api_key.is_empty() {
        info!("No API key configured; sessions will fail to connect until one is set");
    }

    let controller = SessionController::new(
        config.clone(),
        Arc::new(WavBackend),
        Arc::new(GeminiConnector),
        ToolRegistry::nurse(),
    )
    .on_detection(|detection| info!(%detection, "Patient state detected"));
    let controller = Arc::new(controller);

    let app_state = AppState::new(config.clone(), controller.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/session", web::get().to(handlers::session_status))
                    .route("/session/events", web::get().to(handlers::session_events))
                    .route("/session/start", web::post().to(handlers::start_session))
                    .route("/session/stop", web::post().to(handlers::stop_session))
                    .route("/session/text", web::post().to(handlers::send_text)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    let last = controller.stop().await;
    info!(state = ?last.state, "Voice session stopped");
    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: what gets logged (e.g. "debug", "nurse_voice_backend=trace")
/// - If not set, defaults to "nurse_voice_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nurse_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
