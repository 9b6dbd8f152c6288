use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the amxforge binary.
#[derive(Debug, Parser)]
#[command(name = "amxforge", version, about = "AMX Mod X compile service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "AMXFORGE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP compile service.
    Serve(Box<ServeArgs>),
    /// Compile local source files once and write the archive to a directory.
    Compile(CompileArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CompilerOverrides {
    /// Override the compiler executable path.
    #[arg(long = "compiler-path", value_name = "PATH")]
    pub compiler_path: Option<PathBuf>,

    /// Override the directory exported as the compiler's library search path.
    #[arg(long = "compiler-library-dir", value_name = "PATH")]
    pub compiler_library_dir: Option<PathBuf>,

    /// Override the directory holding the official include files.
    #[arg(long = "compiler-include-dir", value_name = "PATH")]
    pub compiler_include_dir: Option<PathBuf>,

    /// Override the per-plugin compile timeout.
    #[arg(long = "compiler-timeout-seconds", value_name = "SECONDS")]
    pub compiler_timeout_seconds: Option<u64>,

    /// Override how many plugins of one request compile at the same time.
    #[arg(long = "compiler-concurrency", value_name = "COUNT")]
    pub compiler_concurrency: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub compiler: CompilerOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the maximum number of plugins per request.
    #[arg(long = "max-plugins", value_name = "COUNT")]
    pub max_plugins: Option<u32>,

    /// Override the maximum number of shared include files per request.
    #[arg(long = "max-includes", value_name = "COUNT")]
    pub max_includes: Option<u32>,

    /// Cap the request body size in bytes (unlimited when unset).
    #[arg(long = "max-request-bytes", value_name = "BYTES")]
    pub max_request_bytes: Option<u64>,

    /// Override the directory where build sandboxes are created.
    #[arg(long = "work-dir", value_name = "PATH")]
    pub work_dir: Option<PathBuf>,

    /// Override the directory where download archives are kept.
    #[arg(long = "downloads-dir", value_name = "PATH")]
    pub downloads_dir: Option<PathBuf>,

    /// Override how long archives and their metadata are retained.
    #[arg(long = "retention-seconds", value_name = "SECONDS")]
    pub retention_seconds: Option<u64>,

    /// Override how often the reclaimer runs.
    #[arg(long = "cleanup-interval-seconds", value_name = "SECONDS")]
    pub cleanup_interval_seconds: Option<u64>,

    /// Override the compile rate limit window size.
    #[arg(long = "rate-limit-window-seconds", value_name = "SECONDS")]
    pub rate_limit_window_seconds: Option<u64>,

    /// Override the compile rate limit request ceiling.
    #[arg(long = "rate-limit-max-requests", value_name = "COUNT")]
    pub rate_limit_max_requests: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct CompileArgs {
    #[command(flatten)]
    pub compiler: CompilerOverrides,

    /// Shared include file made visible to every plugin (repeatable).
    #[arg(long = "include", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub includes: Vec<PathBuf>,

    /// Directory the resulting archive is copied into.
    #[arg(
        long = "output",
        value_name = "DIR",
        default_value = ".",
        value_hint = ValueHint::DirPath
    )]
    pub output: PathBuf,

    /// Plugin sources to compile.
    #[arg(value_name = "SOURCE", required = true, value_hint = ValueHint::FilePath)]
    pub sources: Vec<PathBuf>,
}
