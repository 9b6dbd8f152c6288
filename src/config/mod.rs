//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::batch::BatchLimits;

pub use cli::{CliArgs, Command, CompileArgs, CompilerOverrides, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "amxforge";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_COMPILER_PATH: &str = "./amxxpc";
const DEFAULT_COMPILER_LIBRARY_DIR: &str = ".";
const DEFAULT_COMPILER_INCLUDE_DIR: &str = "./scripting/include";
const DEFAULT_COMPILE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_COMPILE_CONCURRENCY: u32 = 1;
const DEFAULT_MAX_PLUGINS: u32 = 10;
const DEFAULT_MAX_INCLUDES: u32 = 10;
const DEFAULT_DOWNLOADS_DIRNAME: &str = "amxx_downloads";
const DEFAULT_RETENTION_SECS: u64 = 600;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 120;
const DEFAULT_RATE_LIMIT_MAX_REQUESTS: u64 = 10;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub compiler: CompilerSettings,
    pub limits: LimitSettings,
    pub storage: StorageSettings,
    pub retention: RetentionSettings,
    pub rate_limit: RateLimitSettings,
}

impl Settings {
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_units: self.limits.max_plugins.get() as usize,
            max_includes: self.limits.max_includes as usize,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CompilerSettings {
    pub executable: PathBuf,
    /// Exported to the compiler as its dynamic-library search path.
    pub library_dir: PathBuf,
    /// Official includes; always searched before anything the client uploads.
    pub include_dir: PathBuf,
    pub timeout: Duration,
    pub concurrency: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
    pub max_plugins: NonZeroU32,
    pub max_includes: u32,
    pub max_request_bytes: Option<NonZeroU64>,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub work_dir: PathBuf,
    pub downloads_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub window: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub window_seconds: NonZeroU32,
    pub max_requests: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("AMXFORGE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Compile(args)) => raw.apply_compiler_overrides(&args.compiler),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    compiler: RawCompilerSettings,
    limits: RawLimitSettings,
    storage: RawStorageSettings,
    retention: RawRetentionSettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(max) = overrides.max_plugins {
            self.limits.max_plugins = Some(max);
        }
        if let Some(max) = overrides.max_includes {
            self.limits.max_includes = Some(max);
        }
        if let Some(bytes) = overrides.max_request_bytes {
            self.limits.max_request_bytes = Some(bytes);
        }
        if let Some(dir) = overrides.work_dir.as_ref() {
            self.storage.work_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.downloads_dir.as_ref() {
            self.storage.downloads_dir = Some(dir.clone());
        }
        if let Some(seconds) = overrides.retention_seconds {
            self.retention.window_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.cleanup_interval_seconds {
            self.retention.cleanup_interval_seconds = Some(seconds);
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }

        self.apply_compiler_overrides(&overrides.compiler);
    }

    fn apply_compiler_overrides(&mut self, overrides: &CompilerOverrides) {
        if let Some(path) = overrides.compiler_path.as_ref() {
            self.compiler.path = Some(path.clone());
        }
        if let Some(dir) = overrides.compiler_library_dir.as_ref() {
            self.compiler.library_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.compiler_include_dir.as_ref() {
            self.compiler.include_dir = Some(dir.clone());
        }
        if let Some(seconds) = overrides.compiler_timeout_seconds {
            self.compiler.timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.compiler_concurrency {
            self.compiler.concurrency = Some(count);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            compiler,
            limits,
            storage,
            retention,
            rate_limit,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            compiler: build_compiler_settings(compiler)?,
            limits: build_limit_settings(limits)?,
            storage: build_storage_settings(storage)?,
            retention: build_retention_settings(retention)?,
            rate_limit: build_rate_limit_settings(rate_limit)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_compiler_settings(compiler: RawCompilerSettings) -> Result<CompilerSettings, LoadError> {
    let executable = non_empty_path(
        compiler.path,
        DEFAULT_COMPILER_PATH,
        "compiler.path",
    )?;
    let library_dir = non_empty_path(
        compiler.library_dir,
        DEFAULT_COMPILER_LIBRARY_DIR,
        "compiler.library_dir",
    )?;
    let include_dir = non_empty_path(
        compiler.include_dir,
        DEFAULT_COMPILER_INCLUDE_DIR,
        "compiler.include_dir",
    )?;

    let timeout_secs = compiler
        .timeout_seconds
        .unwrap_or(DEFAULT_COMPILE_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "compiler.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let concurrency = non_zero_u32(
        compiler
            .concurrency
            .unwrap_or(DEFAULT_COMPILE_CONCURRENCY)
            .into(),
        "compiler.concurrency",
    )?;

    Ok(CompilerSettings {
        executable,
        library_dir,
        include_dir,
        timeout: Duration::from_secs(timeout_secs),
        concurrency,
    })
}

fn build_limit_settings(limits: RawLimitSettings) -> Result<LimitSettings, LoadError> {
    let max_plugins = non_zero_u32(
        limits.max_plugins.unwrap_or(DEFAULT_MAX_PLUGINS).into(),
        "limits.max_plugins",
    )?;
    let max_includes = limits.max_includes.unwrap_or(DEFAULT_MAX_INCLUDES);

    let max_request_bytes = match limits.max_request_bytes {
        Some(value) => {
            let bytes = NonZeroU64::new(value).ok_or_else(|| {
                LoadError::invalid("limits.max_request_bytes", "must be greater than zero")
            })?;
            usize::try_from(value).map_err(|_| {
                LoadError::invalid(
                    "limits.max_request_bytes",
                    "value exceeds supported range for usize",
                )
            })?;
            Some(bytes)
        }
        None => None,
    };

    Ok(LimitSettings {
        max_plugins,
        max_includes,
        max_request_bytes,
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let work_dir = storage.work_dir.unwrap_or_else(std::env::temp_dir);
    if work_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.work_dir",
            "path must not be empty",
        ));
    }

    let downloads_dir = storage
        .downloads_dir
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DOWNLOADS_DIRNAME));
    if downloads_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "storage.downloads_dir",
            "path must not be empty",
        ));
    }

    Ok(StorageSettings {
        work_dir,
        downloads_dir,
    })
}

fn build_retention_settings(
    retention: RawRetentionSettings,
) -> Result<RetentionSettings, LoadError> {
    let window_secs = retention.window_seconds.unwrap_or(DEFAULT_RETENTION_SECS);
    if window_secs == 0 {
        return Err(LoadError::invalid(
            "retention.window_seconds",
            "must be greater than zero",
        ));
    }

    let interval_secs = retention
        .cleanup_interval_seconds
        .unwrap_or(DEFAULT_CLEANUP_INTERVAL_SECS);
    if interval_secs == 0 {
        return Err(LoadError::invalid(
            "retention.cleanup_interval_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RetentionSettings {
        window: Duration::from_secs(window_secs),
        cleanup_interval: Duration::from_secs(interval_secs),
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitSettings, LoadError> {
    let window_seconds_val = rate_limit
        .window_seconds
        .unwrap_or(DEFAULT_RATE_LIMIT_WINDOW_SECS);
    let window_seconds = non_zero_u32(window_seconds_val, "rate_limit.window_seconds")?;

    let max_requests_val = rate_limit
        .max_requests
        .unwrap_or(DEFAULT_RATE_LIMIT_MAX_REQUESTS);
    let max_requests = non_zero_u32(max_requests_val, "rate_limit.max_requests")?;

    Ok(RateLimitSettings {
        window_seconds,
        max_requests,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCompilerSettings {
    path: Option<PathBuf>,
    library_dir: Option<PathBuf>,
    include_dir: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    concurrency: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLimitSettings {
    max_plugins: Option<u32>,
    max_includes: Option<u32>,
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    work_dir: Option<PathBuf>,
    downloads_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRetentionSettings {
    window_seconds: Option<u64>,
    cleanup_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
