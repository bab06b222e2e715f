//! HTTP host exposing a throttled and an unthrottled endpoint.

use std::future::Future;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::token_bucket::TokenBucket;

#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<TokenBucket>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/limited", get(limited))
        .route("/unlimited", get(unlimited))
        .with_state(state)
}

async fn limited(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.limiter.allow() {
        tracing::info!(path = "/limited", "request allowed");
        (StatusCode::OK, "Request was processed.\n")
    } else {
        tracing::info!(path = "/limited", "request denied");
        (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests.\n")
    }
}

async fn unlimited() -> (StatusCode, &'static str) {
    tracing::info!(path = "/unlimited", "request allowed");
    (StatusCode::OK, "Unlimited request was processed.\n")
}

/// Serves until `shutdown` resolves, then stops the bucket's refill thread.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let limiter = Arc::clone(&state.limiter);
    let result = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await;
    // Joins the refill thread, so keep it off the async workers.
    if tokio::task::spawn_blocking(move || limiter.stop())
        .await
        .is_err()
    {
        tracing::warn!("failed to stop token bucket");
    }
    result
}
