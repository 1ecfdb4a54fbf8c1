use std::future::Future;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::echo::EchoSource;
use crate::error::FanoutError;
use crate::fanout::Aggregator;

pub struct AppState<S> {
    aggregator: Arc<Aggregator<S>>,
}

// Derive would demand `S: Clone`; only the Arc is cloned.
impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            aggregator: Arc::clone(&self.aggregator),
        }
    }
}

/// Build the HTTP surface: `GET /parallel`.
pub fn router<S: EchoSource>(aggregator: Arc<Aggregator<S>>) -> Router {
    Router::new()
        .route("/parallel", get(parallel::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { aggregator })
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// One fan-out per request. If the caller disconnects, axum drops this
/// future and the guard cancels every in-flight sub-request.
async fn parallel<S: EchoSource>(
    State(state): State<AppState<S>>,
) -> Result<String, FanoutError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    state.aggregator.run(&cancel).await
}

impl IntoResponse for FanoutError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::SubRequest { .. } | Self::Cancelled | Self::WorkerPanicked { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.user_message()).into_response()
    }
}
