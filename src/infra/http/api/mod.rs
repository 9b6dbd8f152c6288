pub mod error;
pub mod handlers;
pub mod middleware;
pub mod rate_limit;
pub mod state;

pub use state::ApiState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::infra::http::middleware::{log_responses, set_request_context};

/// Routes of the compile API. `body_limit` of `None` accepts bodies of any size.
pub fn build_api_router(state: ApiState, body_limit: Option<usize>) -> Router {
    let compile = Router::new()
        .route("/compile", post(handlers::compile))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::compile_rate_limit,
        ));

    let body_limit = match body_limit {
        Some(bytes) => DefaultBodyLimit::max(bytes),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .route("/download/{id}", get(handlers::download))
        .route("/info/{id}", get(handlers::info))
        .merge(compile)
        .method_not_allowed_fallback(handlers::method_not_allowed)
        .fallback(handlers::unknown_endpoint)
        .with_state(state)
        .layer(body_limit)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
