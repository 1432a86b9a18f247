//! HTTP server for the Prometheus metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info};

use crate::config::ErrorHandling;
use crate::gather::Gatherer;
use crate::metrics::Exposition;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Default time allowed to answer one request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    gatherer: Arc<Gatherer>,
    error_handling: ErrorHandling,
}

/// Create the HTTP router.
fn create_router(
    gatherer: Arc<Gatherer>,
    metrics_path: &str,
    error_handling: ErrorHandling,
    request_timeout: Duration,
) -> Router {
    let state = AppState {
        gatherer,
        error_handling,
    };

    let mut router = Router::new()
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler));

    if metrics_path != "/" {
        let target = metrics_path.to_string();
        router = router.route(
            "/",
            get(move || {
                let target = target.clone();
                async move { Redirect::permanent(&target) }
            }),
        );
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

/// Handler for the metrics endpoint. Every request runs a fresh scrape.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let exposition = state.gatherer.gather().await;
    if exposition.has_errors() {
        debug!(
            errors = exposition.errors.len(),
            "Serving scrape with collection errors"
        );
    }

    exposition_response(exposition, state.error_handling)
}

fn exposition_response(exposition: Exposition, error_handling: ErrorHandling) -> Response {
    let Exposition { mut body, errors } = exposition;

    if errors.is_empty() {
        return (StatusCode::OK, [(CONTENT_TYPE, TEXT_FORMAT)], body).into_response();
    }

    match error_handling {
        ErrorHandling::HttpError => {
            let mut message = String::from("An error has occurred while serving metrics:\n\n");
            for error in &errors {
                message.push_str(error);
                message.push('\n');
            }

            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                message,
            )
                .into_response()
        }
        ErrorHandling::Continue => {
            for error in &errors {
                // Comment lines must stay on one line.
                body.push_str("# ");
                body.push_str(&error.replace('\n', " "));
                body.push('\n');
            }

            (StatusCode::OK, [(CONTENT_TYPE, TEXT_FORMAT)], body).into_response()
        }
    }
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP server configuration.
pub struct HttpServer {
    gatherer: Arc<Gatherer>,
    listen_addr: SocketAddr,
    metrics_path: String,
    error_handling: ErrorHandling,
    request_timeout: Duration,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        gatherer: Arc<Gatherer>,
        listen_addr: SocketAddr,
        metrics_path: String,
        error_handling: ErrorHandling,
    ) -> Self {
        Self {
            gatherer,
            listen_addr,
            metrics_path,
            error_handling,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound the time spent on each request; slower requests get HTTP 408.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        let router = create_router(
            self.gatherer,
            &self.metrics_path,
            self.error_handling,
            self.request_timeout,
        );

        info!(
            addr = %addr,
            path = %self.metrics_path,
            "HTTP server listening"
        );

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        info!("HTTP server stopped");
        Ok(())
    }
}
