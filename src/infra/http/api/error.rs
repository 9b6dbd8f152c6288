use amxforge_api_types::{ErrorBody, ErrorMessage};
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::application::error::ErrorReport;
use crate::domain::error::BatchRejection;

pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const NO_PLUGINS: &str = "no_plugins";
    pub const TOO_MANY_PLUGINS: &str = "too_many_plugins";
    pub const TOO_MANY_INCLUDES: &str = "too_many_includes";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNKNOWN_ENDPOINT: &str = "unknown_endpoint";
    pub const METHOD_NOT_ALLOWED: &str = "method_not_allowed";
    pub const FILE_RECLAIMED: &str = "file_reclaimed";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorMessage,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorMessage {
                code: code.to_string(),
                message: message.into(),
                hint: None,
                retry_after_seconds: None,
                retention_seconds: None,
                submitted: None,
                limit: None,
            },
            report: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.body.hint = Some(hint.into());
        self
    }

    pub fn invalid_json(rejection: &JsonRejection) -> Self {
        Self::new(rejection.status(), codes::INVALID_JSON, "Invalid JSON")
            .with_hint(rejection.body_text())
    }

    pub fn rejected(rejection: &BatchRejection) -> Self {
        let code = match rejection {
            BatchRejection::NoUnits => codes::NO_PLUGINS,
            BatchRejection::TooManyUnits { .. } => codes::TOO_MANY_PLUGINS,
            BatchRejection::TooManyIncludes { .. } => codes::TOO_MANY_INCLUDES,
        };
        let mut error = Self::new(StatusCode::BAD_REQUEST, code, rejection.to_string());
        error.body.submitted = rejection.submitted();
        error.body.limit = rejection.limit();
        error
    }

    /// Unknown or expired identifier. Carries the retention window so clients know why.
    pub fn not_found(retention_seconds: u64) -> Self {
        let mut error = Self::new(
            StatusCode::NOT_FOUND,
            codes::NOT_FOUND,
            "Compilation not found",
        )
        .with_hint("The compilation ID is invalid or has expired");
        error.body.retention_seconds = Some(retention_seconds);
        error
    }

    /// Metadata still present but the archive is gone.
    pub fn file_reclaimed(retention_seconds: u64) -> Self {
        let mut error = Self::new(StatusCode::NOT_FOUND, codes::FILE_RECLAIMED, "File not found")
            .with_hint("The compiled files have been cleaned up");
        error.body.retention_seconds = Some(retention_seconds);
        error
    }

    pub fn unknown_endpoint(path: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            codes::UNKNOWN_ENDPOINT,
            "Endpoint not found",
        )
        .with_hint(format!("Nothing is served at `{path}`; GET /health lists the endpoints"))
    }

    pub fn method_not_allowed(method: &str, path: &str) -> Self {
        Self::new(
            StatusCode::METHOD_NOT_ALLOWED,
            codes::METHOD_NOT_ALLOWED,
            "Method not allowed",
        )
        .with_hint(format!("`{path}` does not accept {method}"))
    }

    pub fn internal(source: &'static str, error: &dyn std::error::Error) -> Self {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let mut api_error = Self::new(status, codes::INTERNAL, "Internal server error");
        api_error.report = Some(ErrorReport::from_error(source, status, error));
        api_error
    }

    pub fn rate_limited(retry_after: u64, limit: u32) -> Response {
        let mut error = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            codes::RATE_LIMITED,
            "Rate limit exceeded",
        )
        .with_hint(format!(
            "At most {limit} compilations per {retry_after} seconds; retry after {retry_after} seconds"
        ));
        error.body.retry_after_seconds = Some(retry_after);
        error.body.limit = Some(limit as usize);
        error.report = Some(ErrorReport::from_message(
            "infra::http::api::rate_limit",
            StatusCode::TOO_MANY_REQUESTS,
            format!("rate_limited: retry_after={retry_after}"),
        ));

        let mut response = error.into_response();
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                "infra::http::api",
                self.status,
                format!("{}: {}", self.body.code, self.body.message),
            )
        });
        let body = ErrorBody {
            success: false,
            error: self.body,
        };
        let mut response = (self.status, Json(body)).into_response();
        // Attach a structured report so shared logging middleware can emit rich diagnostics.
        report.attach(&mut response);
        response
    }
}
