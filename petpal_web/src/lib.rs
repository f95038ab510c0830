// THEORY:
// `petpal_web` is the control surface. It never touches hardware itself:
// every route goes through an `EngineHandle`, so the page, the MJPEG stream
// and the status endpoint see the same state the frame pump does.
//
// The server stops on its own once the engine reports it has stopped, which
// is how `POST /shutdown` ends the process.

pub mod error;
pub mod page;
pub mod routes;
pub mod settings;

use axum::Router;
use axum::routing::{get, post};
use petpal::EngineHandle;

pub use error::AppError;
pub use settings::{Backend, Settings};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
}

pub fn build_router(engine: EngineHandle) -> Router {
    Router::new()
        .route("/", get(routes::index).post(routes::set_feeding_time))
        .route("/manual_trigger", post(routes::manual_trigger))
        .route("/reset", post(routes::reset))
        .route("/video_feed", get(routes::video_feed))
        .route("/shutdown", post(routes::shutdown))
        .route("/status", get(routes::status))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(AppState { engine })
}

/// Binds the listener and serves until the engine has stopped. Binding
/// happens before this returns so an unusable address fails start-up.
pub async fn start_server(
    engine: EngineHandle,
    cfg: ServerConfig,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "PetPal listening");

    let app = build_router(engine.clone());
    let server = tokio::spawn(async move {
        let stopped = async move { engine.stopped().await };
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(stopped)
            .await
        {
            tracing::error!(%error, "server failed");
        }
    });
    Ok(server)
}
