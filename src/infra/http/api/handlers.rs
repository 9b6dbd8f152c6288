use std::collections::BTreeMap;
use std::io;

use amxforge_api_types::{
    CompileRequest, CompileResponse, CompileSummary, DiagnosticView, DownloadInfo, HealthLimits,
    HealthResponse, InfoDownload, InfoResponse, InfoSummary, PluginResult, RateLimitInfo,
    StatsResponse,
};
use axum::Json;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, stream};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::application::compile::{BatchError, BatchResult, CompileResult};
use crate::application::retention::RetentionEntry;
use crate::domain::diagnostics::Diagnostic;
use crate::infra::http::middleware::CompilationTag;

use super::error::ApiError;
use super::state::ApiState;

const SERVICE_NAME: &str = "AMXX Compiler API";
const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let limits = state.compile.limits();
    let window = state.rate_limiter.window().as_secs();
    let max_requests = state.rate_limiter.limit();
    let timeout = state.compile.compiler().timeout().as_secs();

    let endpoints = BTreeMap::from([
        ("compile".to_string(), "/compile (POST)".to_string()),
        ("download".to_string(), "/download/{id} (GET)".to_string()),
        ("info".to_string(), "/info/{id} (GET)".to_string()),
        ("stats".to_string(), "/stats (GET)".to_string()),
    ]);

    Json(HealthResponse {
        success: true,
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        features: vec![
            format!("Compile up to {} .sma files per request", limits.max_units),
            format!(
                "Support for {} shared .inc files per request",
                limits.max_includes
            ),
            format!("{max_requests} compilations per {window} seconds per client"),
            "Automatic file cleanup".to_string(),
            "tar.gz download for compiled plugins".to_string(),
        ],
        endpoints,
        limits: HealthLimits {
            max_plugins: limits.max_units,
            max_includes: limits.max_includes,
            rate_limit: format!("{max_requests} compilations per {window} seconds"),
            timeout_per_plugin: format!("{timeout} seconds"),
        },
    })
}

pub async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let available_downloads = count_files(state.compile.packager().downloads_dir())
        .await
        .unwrap_or(0);

    Json(StatsResponse {
        success: true,
        active_compilations: state.compile.store().len(),
        available_downloads,
        cleanup_interval: format!("{} seconds", state.cleanup_interval.as_secs()),
        file_retention: format!("{} seconds", state.retention_seconds()),
    })
}

pub async fn compile(
    State(state): State<ApiState>,
    payload: Result<Json<CompileRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|rejection| ApiError::invalid_json(&rejection))?;

    // Detached so a client disconnect cannot interrupt sandbox cleanup.
    let service = state.compile.clone();
    let outcome = tokio::spawn(async move { service.process_request(request).await })
        .await
        .map_err(|err| ApiError::internal("infra::http::api::compile", &err))?;

    let batch = outcome.map_err(|err| match &err {
        BatchError::Rejected(rejection) => ApiError::rejected(rejection),
        BatchError::Sandbox(_) | BatchError::Package(_) => {
            ApiError::internal("infra::http::api::compile", &err)
        }
    })?;

    let id = batch.id;
    let mut response = Json(compile_response(&state, batch)).into_response();
    CompilationTag(id).attach(&mut response);
    Ok(response)
}

pub async fn download(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let entry = lookup(&state, &id)?;
    let path = state
        .compile
        .packager()
        .downloads_dir()
        .join(&entry.archive_filename);

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ApiError::file_reclaimed(state.retention_seconds()));
        }
        Err(err) => return Err(ApiError::internal("infra::http::api::download", &err)),
    };
    let length = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal("infra::http::api::download", &err))?
        .len();

    // The open handle keeps the archive readable even if the reclaimer unlinks it now.
    let mut response = (StatusCode::OK, Body::from_stream(file_chunks(file))).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(ARCHIVE_CONTENT_TYPE),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", entry.archive_filename))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    CompilationTag(entry.id).attach(&mut response);
    Ok(response)
}

pub async fn info(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let entry = lookup(&state, &id)?;
    let archive = state
        .compile
        .packager()
        .downloads_dir()
        .join(&entry.archive_filename);
    if !tokio::fs::try_exists(&archive).await.unwrap_or(false) {
        return Err(ApiError::file_reclaimed(state.retention_seconds()));
    }

    let age = entry.age(OffsetDateTime::now_utc());
    let expires_in = state.retention.saturating_sub(age);

    let id = entry.id;
    let mut response = Json(InfoResponse {
        success: true,
        compilation_id: entry.id,
        created: rfc3339(entry.created_at),
        age_seconds: age.as_secs(),
        expires_in_seconds: expires_in.as_secs(),
        summary: InfoSummary {
            total: entry.total,
            successful: entry.successful,
            failed: entry.failed,
        },
        download: InfoDownload {
            filename: entry.archive_filename,
            url: download_url(entry.id),
        },
    })
    .into_response();
    CompilationTag(id).attach(&mut response);
    Ok(response)
}

pub async fn unknown_endpoint(uri: Uri) -> ApiError {
    ApiError::unknown_endpoint(uri.path())
}

pub async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::method_not_allowed(method.as_str(), uri.path())
}

fn lookup(state: &ApiState, raw_id: &str) -> Result<RetentionEntry, ApiError> {
    Uuid::parse_str(raw_id)
        .ok()
        .and_then(|id| state.compile.store().get(&id))
        .ok_or_else(|| ApiError::not_found(state.retention_seconds()))
}

fn compile_response(state: &ApiState, batch: BatchResult) -> CompileResponse {
    let summary = CompileSummary {
        total: batch.total(),
        successful: batch.successful,
        failed: batch.failed,
        success_rate: format!("{:.1}%", batch.success_rate()),
    };

    let download = batch.download.map(|download| DownloadInfo {
        available: true,
        url: download_url(download.id),
        filename: download.filename,
        size_bytes: download.size_bytes,
        size_mb: format!("{:.2}", download.size_bytes as f64 / 1024.0 / 1024.0),
        expires_in: format!("{} seconds", state.retention_seconds()),
    });

    CompileResponse {
        success: true,
        compilation_id: batch.id,
        timestamp: rfc3339(batch.finished_at),
        summary,
        results: batch.results.into_iter().map(plugin_result).collect(),
        download,
        rate_limit: RateLimitInfo {
            max_per_window: state.rate_limiter.limit(),
            window_seconds: state.rate_limiter.window().as_secs(),
        },
    }
}

fn plugin_result(result: CompileResult) -> PluginResult {
    PluginResult {
        plugin: result.name.to_string(),
        success: result.success,
        errors: result
            .diagnostics
            .errors
            .into_iter()
            .map(diagnostic_view)
            .collect(),
        warnings: result
            .diagnostics
            .warnings
            .into_iter()
            .map(diagnostic_view)
            .collect(),
        log: result.log,
        size: result.size,
        failure: result.failure.map(|kind| kind.as_str().to_string()),
    }
}

fn diagnostic_view(diagnostic: Diagnostic) -> DiagnosticView {
    DiagnosticView {
        line: diagnostic.line,
        code: diagnostic.code,
        message: diagnostic.message,
    }
}

fn download_url(id: Uuid) -> String {
    format!("/download/{id}")
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

fn file_chunks(file: tokio::fs::File) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::try_unfold(file, |mut file| async move {
        let mut chunk = BytesMut::with_capacity(DOWNLOAD_CHUNK_BYTES);
        let read = file.read_buf(&mut chunk).await?;
        Ok::<_, io::Error>((read > 0).then(|| (chunk.freeze(), file)))
    })
}

async fn count_files(dir: &std::path::Path) -> io::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn archive_is_streamed_in_bounded_chunks() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("archive.tar.gz");
        let contents: Vec<u8> = (0..150 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &contents).expect("write archive");

        let file = tokio::fs::File::open(&path).await.expect("open");
        let chunks: Vec<Bytes> = file_chunks(file).try_collect().await.expect("stream");

        assert!(chunks.len() >= 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= DOWNLOAD_CHUNK_BYTES));
        assert_eq!(chunks.concat(), contents);
    }
}
