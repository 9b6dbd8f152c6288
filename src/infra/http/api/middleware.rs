use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics::counter;
use tracing::debug;

use super::error::ApiError;
use super::state::ApiState;

const UNKNOWN_CLIENT: &str = "unknown";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Per-address limit on compile requests.
pub async fn compile_rate_limit(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let key = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string());

    let (allowed, remaining) = state.rate_limiter.allow(&key, &path);
    if !allowed {
        counter!("amxforge_rate_limited_total").increment(1);
        debug!(
            target = "amxforge::api::ratelimit",
            client = %key,
            "compile request rate limited"
        );
        return ApiError::rate_limited(
            state.rate_limiter.retry_after_secs(),
            state.rate_limiter.limit(),
        );
    }

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(REMAINING_HEADER, HeaderValue::from(remaining));
    response
}
