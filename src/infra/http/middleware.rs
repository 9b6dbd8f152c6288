use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::error::ErrorReport;

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request identity, available to handlers and to [`log_responses`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client: Option<IpAddr>,
}

/// Compilation a response belongs to. Handlers attach it so the access log can tie
/// a request to its batch.
#[derive(Debug, Clone, Copy)]
pub struct CompilationTag(pub Uuid);

impl CompilationTag {
    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ctx = RequestContext {
        request_id: request_id.clone(),
        client,
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

/// Log failed requests with their error report, and every request that produced
/// or served a compilation.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let (request_id, client) = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| {
            (
                ctx.request_id.clone(),
                ctx.client.map(|ip| ip.to_string()).unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = start.elapsed().as_millis() as u64;
    let compilation_id = response
        .extensions()
        .get::<CompilationTag>()
        .map(|CompilationTag(id)| id.to_string())
        .unwrap_or_default();

    if !status.is_client_error() && !status.is_server_error() {
        if !compilation_id.is_empty() {
            info!(
                target = "amxforge::http::response",
                status = status.as_u16(),
                method = %method,
                path = %path,
                elapsed_ms,
                compilation_id = %compilation_id,
                client = %client,
                request_id = %request_id,
                "compilation request served",
            );
        }
        return response;
    }

    let report = response.extensions_mut().remove::<ErrorReport>();
    let (source, messages) = match report {
        Some(report) => (report.source, report.messages),
        None => ("unknown", Vec::new()),
    };
    let detail = messages
        .first()
        .cloned()
        .unwrap_or_else(|| "no diagnostic available".to_string());

    if status.is_server_error() {
        error!(
            target = "amxforge::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail = %detail,
            chain = ?messages,
            client = %client,
            request_id = %request_id,
            "request failed",
        );
    } else {
        warn!(
            target = "amxforge::http::response",
            status = status.as_u16(),
            method = %method,
            path = %path,
            elapsed_ms,
            source,
            detail = %detail,
            client = %client,
            request_id = %request_id,
            "client request error",
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::Extension,
        http::StatusCode,
        middleware::from_fn,
        response::IntoResponse,
        routing::get,
    };
    use tower::ServiceExt;

    async fn tagged(Extension(ctx): Extension<RequestContext>) -> Response {
        let mut response = ctx
            .client
            .map(|ip| ip.to_string())
            .unwrap_or_default()
            .into_response();
        CompilationTag(Uuid::nil()).attach(&mut response);
        response
    }

    #[tokio::test]
    async fn context_carries_client_and_response_keeps_tag() {
        let app = Router::new()
            .route("/tagged", get(tagged))
            .layer(from_fn(log_responses))
            .layer(from_fn(set_request_context));

        let mut request = Request::builder()
            .uri("/tagged")
            .body(Body::empty())
            .expect("request");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([198, 51, 100, 7], 4000))));

        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        assert!(response.extensions().get::<CompilationTag>().is_some());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(&body[..], b"198.51.100.7");
    }
}
