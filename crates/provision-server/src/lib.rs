//! Provision Server
//!
//! HTTP surface over a [`ProvisionService`]:
//!
//! | route | |
//! |---|---|
//! | `POST /v1/install` | start provisioning, returns the pending operation |
//! | `GET /v1/operations/:id` | operation snapshot |
//! | `DELETE /v1/operations/:id` | forget an operation |
//! | `POST /v1/operations/:id/wait` | block until done or `timeout_ms` |
//! | `GET /v1/health` | liveness |

mod error;
mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use provision_service::ProvisionService;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, WaitRequest};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
  pub service: Arc<ProvisionService>,
}

pub fn router(service: Arc<ProvisionService>) -> Router {
  let api = Router::new()
    .route("/install", post(handlers::install))
    .route(
      "/operations/:id",
      get(handlers::get_operation).delete(handlers::delete_operation),
    )
    .route("/operations/:id/wait", post(handlers::wait_operation))
    .route("/health", get(handlers::health));

  Router::new()
    .nest("/v1", api)
    .layer(TraceLayer::new_for_http())
    .with_state(AppState { service })
}

/// Serve until `shutdown` resolves.
///
/// Running flows are cancelled and the operation manager is closed as soon
/// as `shutdown` resolves, so open wait requests answer with `Closed` and
/// the connections drain.
pub async fn serve<F>(
  listener: TcpListener,
  service: Arc<ProvisionService>,
  shutdown: F,
) -> std::io::Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let addr = listener.local_addr()?;
  info!(%addr, "server_listening");

  let draining = service.clone();
  let shutdown = async move {
    shutdown.await;
    info!("server_draining");
    draining.shutdown();
    draining.operations().close();
  };

  axum::serve(listener, router(service))
    .with_graceful_shutdown(shutdown)
    .await?;

  info!("server_stopped");
  Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = tokio::signal::ctrl_c().await {
      tracing::error!(error = %e, "failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(mut signal) => {
        signal.recv().await;
      }
      Err(e) => {
        tracing::error!(error = %e, "failed to listen for SIGTERM");
        std::future::pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => info!(signal = "ctrl_c", "shutdown_requested"),
    _ = terminate => info!(signal = "terminate", "shutdown_requested"),
  }
}
