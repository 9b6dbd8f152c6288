use std::{
    collections::BTreeMap,
    future::IntoFuture,
    net::SocketAddr,
    path::Path,
    process,
    sync::Arc,
};

use amxforge::{
    application::{
        compile::{BatchResult, CompileService},
        error::AppError,
        reclaimer::{Reclaimer, ReclaimerConfig},
        retention::RetentionStore,
    },
    config,
    infra::{
        archive::ArtifactPackager,
        compiler::Compiler,
        error::InfraError,
        http::{self, ApiRateLimiter, ApiState},
        sandbox::SandboxManager,
        telemetry,
    },
};
use amxforge_api_types::{CompileRequest, PluginSource};
use tokio::sync::oneshot;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Compile(args) => run_compile(settings, args).await,
    }
}

fn build_compile_service(
    settings: &config::Settings,
    store: RetentionStore,
) -> Result<CompileService, AppError> {
    let compiler = Compiler::new(&settings.compiler)
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    Ok(CompileService::new(
        SandboxManager::new(settings.storage.work_dir.clone()),
        compiler,
        ArtifactPackager::new(settings.storage.downloads_dir.clone()),
        store,
        settings.batch_limits(),
        settings.compiler.concurrency.get() as usize,
    ))
}

async fn prepare_directories(settings: &config::Settings) -> Result<(), AppError> {
    for dir in [&settings.storage.work_dir, &settings.storage.downloads_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }

    if !tokio::fs::try_exists(&settings.compiler.executable)
        .await
        .unwrap_or(false)
    {
        warn!(
            target = "amxforge::startup",
            path = %settings.compiler.executable.display(),
            "compiler executable not found; every compile will fail until it is installed"
        );
    }
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    prepare_directories(&settings).await?;

    let store = RetentionStore::new();
    let service = Arc::new(build_compile_service(&settings, store.clone())?);

    let reclaimer = Reclaimer::new(
        ReclaimerConfig {
            downloads_dir: settings.storage.downloads_dir.clone(),
            work_dir: settings.storage.work_dir.clone(),
            retention: settings.retention.window,
            interval: settings.retention.cleanup_interval,
        },
        store,
    )
    .spawn();

    let state = ApiState {
        compile: service,
        rate_limiter: Arc::new(ApiRateLimiter::new(
            std::time::Duration::from_secs(u64::from(settings.rate_limit.window_seconds.get())),
            settings.rate_limit.max_requests.get(),
        )),
        retention: settings.retention.window,
        cleanup_interval: settings.retention.cleanup_interval,
    };

    let result = serve_http(&settings, state).await;

    reclaimer.shutdown().await;
    info!(target = "amxforge::shutdown", "shutdown complete");

    result
}

async fn serve_http(settings: &config::Settings, state: ApiState) -> Result<(), AppError> {
    let body_limit = settings
        .limits
        .max_request_bytes
        .map(|bytes| bytes.get() as usize);
    let router = http::build_router(state, body_limit);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "amxforge::startup",
        addr = %settings.server.addr,
        "listening"
    );

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = stop_rx.await;
    });
    let mut server = tokio::spawn(server.into_future());

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        () = shutdown_signal() => {}
    }

    info!(
        target = "amxforge::shutdown",
        grace_secs = settings.server.graceful_shutdown.as_secs(),
        "shutdown requested; draining in-flight requests"
    );
    let _ = stop_tx.send(());

    match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!(
                target = "amxforge::shutdown",
                "graceful shutdown window elapsed with requests still running"
            );
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "amxforge::shutdown", error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(target = "amxforge::shutdown", error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run_compile(
    settings: config::Settings,
    args: config::CompileArgs,
) -> Result<(), AppError> {
    prepare_directories(&settings).await?;

    let mut includes = BTreeMap::new();
    for path in &args.includes {
        includes.insert(file_name(path)?, read_source(path).await?);
    }

    let mut plugins = Vec::with_capacity(args.sources.len());
    for path in &args.sources {
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_string);
        plugins.push(PluginSource {
            name,
            code: read_source(path).await?,
            includes: BTreeMap::new(),
        });
    }

    info!(
        target = "amxforge::compile",
        plugins = plugins.len(),
        includes = includes.len(),
        "compiling local sources"
    );

    let store = RetentionStore::new();
    let service = build_compile_service(&settings, store.clone())?;
    let batch = service
        .process_request(CompileRequest { includes, plugins })
        .await?;

    print_results(&batch);

    if let Some(download) = &batch.download {
        let archive = service.packager().archive_path(download.id);
        let target = args.output.join(&download.filename);
        copy_archive(&archive, &target).await?;
        store.remove(&download.id);
        println!("archive: {}", target.display());
    }

    if batch.failed > 0 {
        return Err(AppError::validation(format!(
            "{} of {} plugins failed to compile",
            batch.failed,
            batch.total()
        )));
    }
    Ok(())
}

fn print_results(batch: &BatchResult) {
    for result in &batch.results {
        match result.failure {
            None => println!("{}: ok ({} bytes)", result.name, result.size),
            Some(kind) => println!("{}: failed ({})", result.name, kind.as_str()),
        }
        for diagnostic in &result.diagnostics.errors {
            println!(
                "  error {:03} at line {}: {}",
                diagnostic.code, diagnostic.line, diagnostic.message
            );
        }
        for diagnostic in &result.diagnostics.warnings {
            println!(
                "  warning {:03} at line {}: {}",
                diagnostic.code, diagnostic.line, diagnostic.message
            );
        }
    }
    println!(
        "{} total, {} successful, {} failed ({:.1}%)",
        batch.total(),
        batch.successful,
        batch.failed,
        batch.success_rate()
    );
}

/// Move the archive out of the shared downloads directory.
async fn copy_archive(archive: &Path, target: &Path) -> Result<(), AppError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| AppError::from(InfraError::from(err)))?;
    }
    tokio::fs::copy(archive, target)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    if let Err(err) = tokio::fs::remove_file(archive).await {
        warn!(
            target = "amxforge::compile",
            path = %archive.display(),
            error = %err,
            "failed to remove archive from downloads directory"
        );
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<String, AppError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| AppError::validation(format!("`{}` has no usable file name", path.display())))
}

async fn read_source(path: &Path) -> Result<String, AppError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|err| AppError::validation(format!("failed to read `{}`: {err}", path.display())))
}
