//! Wire types for the amxforge compile API.
//!
//! The server serializes these and clients deserialize them; field names are part of the
//! public contract and must not change without a version bump.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of `POST /compile`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompileRequest {
    /// Include files shared by every plugin in the request.
    #[serde(default)]
    pub includes: BTreeMap<String, String>,
    #[serde(default)]
    pub plugins: Vec<PluginSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub code: String,
    /// Include files visible only to this plugin.
    #[serde(default)]
    pub includes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileResponse {
    pub success: bool,
    pub compilation_id: Uuid,
    pub timestamp: String,
    pub summary: CompileSummary,
    pub results: Vec<PluginResult>,
    pub download: Option<DownloadInfo>,
    pub rate_limit: RateLimitInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub plugin: String,
    pub success: bool,
    pub errors: Vec<DiagnosticView>,
    pub warnings: Vec<DiagnosticView>,
    pub log: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticView {
    pub line: u32,
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub available: bool,
    pub url: String,
    pub filename: String,
    pub size_bytes: u64,
    pub size_mb: String,
    pub expires_in: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub max_per_window: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub success: bool,
    pub status: String,
    pub service: String,
    pub version: String,
    pub features: Vec<String>,
    pub endpoints: BTreeMap<String, String>,
    pub limits: HealthLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthLimits {
    pub max_plugins: usize,
    pub max_includes: usize,
    pub rate_limit: String,
    pub timeout_per_plugin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub success: bool,
    pub active_compilations: usize,
    pub available_downloads: usize,
    pub cleanup_interval: String,
    pub file_retention: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub success: bool,
    pub compilation_id: Uuid,
    pub created: String,
    pub age_seconds: u64,
    pub expires_in_seconds: u64,
    pub summary: InfoSummary,
    pub download: InfoDownload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoDownload {
    pub filename: String,
    pub url: String,
}

/// Error envelope returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: ErrorMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_request_tolerates_missing_optional_fields() {
        let request: CompileRequest =
            serde_json::from_str(r#"{"plugins":[{"code":"public plugin_init(){}"}]}"#)
                .expect("request parses");
        assert!(request.includes.is_empty());
        assert_eq!(request.plugins.len(), 1);
        assert!(request.plugins[0].name.is_none());
        assert!(request.plugins[0].includes.is_empty());
    }

    #[test]
    fn plugin_result_omits_absent_failure() {
        let result = PluginResult {
            plugin: "demo".to_string(),
            success: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            log: String::new(),
            size: 12,
            failure: None,
        };
        let value = serde_json::to_value(&result).expect("serializes");
        assert!(value.get("failure").is_none());
        assert_eq!(value["size"], 12);
    }
}
