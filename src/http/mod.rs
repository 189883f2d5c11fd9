//! HTTP front of the master.
//!
//! Maps the netrender wire protocol onto [`MasterState`]. Every handler
//! resolves errors to a status code here; nothing propagates further.
//!
//! | Status | Meaning                                              |
//! |--------|------------------------------------------------------|
//! | 200    | done / startable                                     |
//! | 202    | nothing to hand out yet, job waiting, frame pending  |
//! | 204    | unknown job, frame, file, slave or rule              |
//! | 206    | frame rendered with an error (`GET /render`)         |
//! | 400    | missing or malformed header / body                   |

pub mod handlers;
pub mod headers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::NetrenderError;
use crate::scheduler::MasterState;

#[derive(Clone)]
pub struct AppState {
    pub master: Arc<RwLock<MasterState>>,
}

impl AppState {
    pub fn new(master: MasterState) -> Self {
        Self {
            master: Arc::new(RwLock::new(master)),
        }
    }
}

impl IntoResponse for NetrenderError {
    fn into_response(self) -> Response {
        if self.is_not_found() {
            tracing::debug!(error = %self, "Unknown id");
            return StatusCode::NO_CONTENT.into_response();
        }
        let status = match self {
            NetrenderError::MissingHeader(_)
            | NetrenderError::InvalidHeader { .. }
            | NetrenderError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/version", get(handlers::version))
        .route("/job", get(handlers::get_job).post(handlers::submit_job))
        .route(
            "/render",
            get(handlers::get_render).put(handlers::put_render),
        )
        .route(
            "/log",
            get(handlers::get_log)
                .post(handlers::post_log)
                .put(handlers::put_log),
        )
        .route("/file", get(handlers::get_file).put(handlers::put_file))
        .route(
            "/slave",
            get(handlers::list_slaves).post(handlers::register_slave),
        )
        .route(
            "/status",
            get(handlers::get_status).head(handlers::head_status),
        )
        .route("/cancel", post(handlers::cancel))
        .route("/reset", post(handlers::reset))
        .route("/balance", get(handlers::get_balance))
        .route("/balance_enable", put(handlers::balance_enable))
        .route("/balance_limit", put(handlers::balance_limit))
        // Scene files and rendered frames are far above the default limit.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the router until `shutdown` is cancelled.
pub async fn run_http_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Master listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
}
