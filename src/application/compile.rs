//! Batch orchestration: validate, build every unit in a sandbox, package the
//! successes, register the archive for download.

use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use amxforge_api_types::CompileRequest;
use futures::{StreamExt, stream};
use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::{
        batch::{BatchLimits, CompilationBatch, SourceUnit},
        diagnostics::{self, Diagnostic, Diagnostics},
        error::BatchRejection,
        filenames::UnitName,
    },
    infra::{
        archive::{Artifact, ArtifactPackager, PackError},
        compiler::{CompileJob, Compiler, CompilerError, CompilerRun},
        sandbox::{self, Sandbox, SandboxError, SandboxManager},
    },
};

use super::retention::{RetentionEntry, RetentionStore};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Rejected(#[from] BatchRejection),
    #[error("sandbox setup failed: {0}")]
    Sandbox(#[from] SandboxError),
    #[error("packaging failed: {0}")]
    Package(#[from] PackError),
}

/// Why a unit failed. Serialized into the `failure` field of each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    CompileError,
    MissingOutput,
    Timeout,
    SpawnFailed,
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CompileError => "compile_error",
            Self::MissingOutput => "missing_output",
            Self::Timeout => "timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::Io => "io_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub name: UnitName,
    pub success: bool,
    pub diagnostics: Diagnostics,
    pub log: String,
    pub size: u64,
    pub failure: Option<FailureKind>,
}

impl CompileResult {
    fn failed(name: UnitName, kind: FailureKind, message: String, log: String) -> Self {
        Self {
            name,
            success: false,
            diagnostics: Diagnostics {
                errors: vec![Diagnostic::synthetic(message)],
                warnings: Vec::new(),
            },
            log,
            size: 0,
            failure: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadMetadata {
    pub id: Uuid,
    pub filename: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub id: Uuid,
    pub finished_at: OffsetDateTime,
    /// Same order as the submitted units.
    pub results: Vec<CompileResult>,
    pub successful: usize,
    pub failed: usize,
    pub download: Option<DownloadMetadata>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Percentage of units that compiled, 0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.results.is_empty() {
            return 0.0;
        }
        self.successful as f64 / self.results.len() as f64 * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct CompileService {
    sandboxes: SandboxManager,
    compiler: Compiler,
    packager: ArtifactPackager,
    store: RetentionStore,
    limits: BatchLimits,
    concurrency: usize,
}

impl CompileService {
    pub fn new(
        sandboxes: SandboxManager,
        compiler: Compiler,
        packager: ArtifactPackager,
        store: RetentionStore,
        limits: BatchLimits,
        concurrency: usize,
    ) -> Self {
        Self {
            sandboxes,
            compiler,
            packager,
            store,
            limits,
            concurrency: concurrency.max(1),
        }
    }

    pub fn limits(&self) -> &BatchLimits {
        &self.limits
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn packager(&self) -> &ArtifactPackager {
        &self.packager
    }

    pub fn store(&self) -> &RetentionStore {
        &self.store
    }

    /// Validate `request` and run it. A rejected request touches no filesystem state.
    pub async fn process_request(&self, request: CompileRequest) -> Result<BatchResult, BatchError> {
        let batch = CompilationBatch::from_request(request, &self.limits).inspect_err(|_| {
            counter!("amxforge_batches_total", "outcome" => "rejected").increment(1);
        })?;
        self.process_batch(batch).await
    }

    pub async fn process_batch(&self, batch: CompilationBatch) -> Result<BatchResult, BatchError> {
        let started_at = Instant::now();
        let id = Uuid::new_v4();
        let units = batch.len();

        let outcome = match self.sandboxes.create(id).await {
            Ok(sandbox) => {
                let outcome = self.run_in_sandbox(id, &sandbox, batch).await;
                sandbox.destroy().await;
                outcome
            }
            Err(err) => Err(err.into()),
        };

        match &outcome {
            Ok(result) => {
                counter!("amxforge_batches_total", "outcome" => "completed").increment(1);
                info!(
                    target = "amxforge::application::compile",
                    batch_id = %id,
                    units,
                    successful = result.successful,
                    failed = result.failed,
                    archived = result.download.is_some(),
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "batch processed"
                );
            }
            Err(err) => {
                counter!("amxforge_batches_total", "outcome" => "error").increment(1);
                warn!(
                    target = "amxforge::application::compile",
                    batch_id = %id,
                    units,
                    error = %err,
                    "batch failed"
                );
            }
        }
        outcome
    }

    async fn run_in_sandbox(
        &self,
        id: Uuid,
        sandbox: &Sandbox,
        batch: CompilationBatch,
    ) -> Result<BatchResult, BatchError> {
        let shared_dir = sandbox.shared_include_dir();
        sandbox::write_includes(&shared_dir, &batch.shared_includes).await?;

        let outcomes: Vec<(CompileResult, Option<Artifact>)> = stream::iter(batch.units)
            .map(|unit| self.compile_unit(sandbox, &shared_dir, unit))
            .buffered(self.concurrency)
            .collect()
            .await;

        let (results, artifacts): (Vec<_>, Vec<_>) = outcomes.into_iter().unzip();
        let artifacts: Vec<Artifact> = artifacts.into_iter().flatten().collect();
        let successful = artifacts.len();
        let failed = results.len() - successful;

        let download = if artifacts.is_empty() {
            None
        } else {
            let packed = self.packager.pack(id, artifacts).await?;
            self.store.put(RetentionEntry {
                id,
                archive_filename: packed.filename.clone(),
                created_at: OffsetDateTime::now_utc(),
                total: results.len(),
                successful,
                failed,
            });
            Some(DownloadMetadata {
                id,
                filename: packed.filename,
                size_bytes: packed.size_bytes,
            })
        };

        Ok(BatchResult {
            id,
            finished_at: OffsetDateTime::now_utc(),
            results,
            successful,
            failed,
            download,
        })
    }

    /// Failures stay inside the returned result; nothing here aborts the batch.
    async fn compile_unit(
        &self,
        sandbox: &Sandbox,
        shared_dir: &Path,
        unit: SourceUnit,
    ) -> (CompileResult, Option<Artifact>) {
        let name = unit.name.clone();
        let outcome = match self.build_unit(sandbox, shared_dir, unit).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                (
                    CompileResult::failed(name, FailureKind::Io, message.clone(), message),
                    None,
                )
            }
        };

        let label = match outcome.0.failure {
            None => "success",
            Some(kind) => kind.as_str(),
        };
        counter!("amxforge_units_total", "result" => label).increment(1);
        outcome
    }

    async fn build_unit(
        &self,
        sandbox: &Sandbox,
        shared_dir: &Path,
        unit: SourceUnit,
    ) -> Result<(CompileResult, Option<Artifact>), SandboxError> {
        let build = sandbox.create_build_dir(unit.index).await?;
        sandbox::write_includes(&build.include_dir, &unit.includes).await?;

        let source_filename = unit.name.source_filename();
        let output_filename = unit.name.binary_filename();
        sandbox::write_file(&build.path.join(&source_filename), &unit.code).await?;

        // Order matters: the compiler takes the first matching include.
        let include_dirs: [PathBuf; 3] = [
            self.compiler.official_include_dir().to_path_buf(),
            shared_dir.to_path_buf(),
            build.include_dir.clone(),
        ];
        let job = CompileJob {
            build_dir: &build.path,
            source_filename: &source_filename,
            output_filename: &output_filename,
            include_dirs: &include_dirs,
        };

        let run = match self.compiler.compile(&job).await {
            Ok(run) => run,
            Err(err) => {
                let kind = match err {
                    CompilerError::Spawn { .. } => FailureKind::SpawnFailed,
                    CompilerError::Capture(_) | CompilerError::Wait(_) => FailureKind::Io,
                };
                let message = err.to_string();
                return Ok((
                    CompileResult::failed(unit.name, kind, message.clone(), message),
                    None,
                ));
            }
        };

        let succeeded = run.succeeded();
        match run {
            CompilerRun::TimedOut { after } => {
                let secs = after.as_secs();
                Ok((
                    CompileResult::failed(
                        unit.name,
                        FailureKind::Timeout,
                        format!("Compilation timed out after {secs} seconds"),
                        format!("Timeout after {secs} seconds"),
                    ),
                    None,
                ))
            }
            CompilerRun::Finished {
                exit_code,
                output,
                output_present,
            } => {
                let diagnostics = diagnostics::parse(&output);
                if !succeeded {
                    let kind = if exit_code == Some(0) && !output_present {
                        FailureKind::MissingOutput
                    } else {
                        FailureKind::CompileError
                    };
                    return Ok((
                        CompileResult {
                            name: unit.name,
                            success: false,
                            diagnostics,
                            log: output,
                            size: 0,
                            failure: Some(kind),
                        },
                        None,
                    ));
                }

                let bytes = tokio::fs::read(job.output_path()).await.map_err(|source| {
                    SandboxError::Read {
                        path: job.output_path(),
                        source,
                    }
                })?;
                let size = bytes.len() as u64;
                Ok((
                    CompileResult {
                        name: unit.name.clone(),
                        success: true,
                        diagnostics,
                        log: output,
                        size,
                        failure: None,
                    },
                    Some(Artifact {
                        name: unit.name,
                        bytes,
                    }),
                ))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, fs, os::unix::fs::PermissionsExt, time::Duration};

    use amxforge_api_types::PluginSource;
    use tempfile::TempDir;

    use crate::config::CompilerSettings;
    use crate::infra::sandbox::SANDBOX_PREFIX;

    /// Fails any source containing `FAIL`, sleeps on `SLOW`, otherwise copies the
    /// source into the output file.
    const FAKE_COMPILER: &str = r#"#!/bin/sh
PATH=/usr/bin:/bin
src="$1"
out="${2#-o}"
if grep -q FAIL "$src"; then
  echo "$src(3) : error 017: undefined symbol \"bar\""
  exit 1
fi
if grep -q SLOW "$src"; then
  exec /bin/sleep 30
fi
echo "$src(1) : warning 217: loose indentation"
cp "$src" "$out"
"#;

    struct Fixture {
        _dir: TempDir,
        work: PathBuf,
        downloads: PathBuf,
        service: CompileService,
    }

    fn fixture(timeout: Duration) -> Fixture {
        let dir = TempDir::new().expect("temp dir");
        let work = dir.path().join("work");
        fixture_with(dir, work, FAKE_COMPILER, timeout)
    }

    fn fixture_with(dir: TempDir, work: PathBuf, script_body: &str, timeout: Duration) -> Fixture {
        let downloads = dir.path().join("downloads");
        fs::create_dir_all(&work).expect("work dir");
        fs::create_dir_all(dir.path().join("include")).expect("official include dir");

        let script = dir.path().join("amxxpc");
        fs::write(&script, script_body).expect("script");
        let mut perms = fs::metadata(&script).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).expect("perms");

        let compiler = Compiler::new(&CompilerSettings {
            executable: script,
            library_dir: dir.path().to_path_buf(),
            include_dir: dir.path().join("include"),
            timeout,
            concurrency: std::num::NonZeroU32::MIN,
        })
        .expect("compiler");

        let service = CompileService::new(
            SandboxManager::new(&work),
            compiler,
            ArtifactPackager::new(&downloads),
            RetentionStore::new(),
            BatchLimits::default(),
            1,
        );
        Fixture {
            _dir: dir,
            work,
            downloads,
            service,
        }
    }

    fn plugin(name: &str, code: &str) -> PluginSource {
        PluginSource {
            name: Some(name.to_string()),
            code: code.to_string(),
            includes: BTreeMap::new(),
        }
    }

    fn sandbox_count(work: &Path) -> usize {
        fs::read_dir(work)
            .expect("read work dir")
            .filter(|entry| {
                entry
                    .as_ref()
                    .map(|entry| entry.file_name().to_string_lossy().starts_with(SANDBOX_PREFIX))
                    .unwrap_or(false)
            })
            .count()
    }

    #[tokio::test]
    async fn mixed_batch_preserves_order_and_archives_successes() {
        let fx = fixture(Duration::from_secs(10));
        let request = CompileRequest {
            includes: BTreeMap::new(),
            plugins: vec![
                plugin("alpha", "ok alpha"),
                plugin("beta", "FAIL"),
                plugin("gamma", "ok gamma"),
            ],
        };

        let result = fx.service.process_request(request).await.expect("batch");

        let names: Vec<_> = result.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        assert_eq!((result.successful, result.failed), (2, 1));
        assert!((result.success_rate() - 66.666).abs() < 0.1);

        let beta = &result.results[1];
        assert_eq!(beta.failure, Some(FailureKind::CompileError));
        assert_eq!(beta.diagnostics.errors.len(), 1);
        assert_eq!(beta.diagnostics.errors[0].line, 3);
        assert_eq!(beta.diagnostics.errors[0].code, 17);

        let alpha = &result.results[0];
        assert!(alpha.success);
        assert_eq!(alpha.size, "ok alpha".len() as u64);
        assert_eq!(alpha.diagnostics.warnings.len(), 1);

        let download = result.download.expect("download");
        assert!(fx.downloads.join(&download.filename).is_file());
        let entry = fx.service.store().get(&download.id).expect("retained");
        assert_eq!((entry.total, entry.successful, entry.failed), (3, 2, 1));

        assert_eq!(sandbox_count(&fx.work), 0);
    }

    #[tokio::test]
    async fn all_failures_produce_no_download() {
        let fx = fixture(Duration::from_secs(10));
        let request = CompileRequest {
            includes: BTreeMap::new(),
            plugins: vec![plugin("broken", "FAIL")],
        };

        let result = fx.service.process_request(request).await.expect("batch");

        assert!(result.download.is_none());
        assert!(fx.service.store().is_empty());
        assert_eq!(sandbox_count(&fx.work), 0);
    }

    #[tokio::test]
    async fn rejected_batch_creates_no_sandbox() {
        let fx = fixture(Duration::from_secs(10));
        let request = CompileRequest {
            includes: BTreeMap::new(),
            plugins: (0..11).map(|i| plugin(&format!("p{i}"), "ok")).collect(),
        };

        let err = fx
            .service
            .process_request(request)
            .await
            .expect_err("rejected");

        assert!(matches!(
            err,
            BatchError::Rejected(BatchRejection::TooManyUnits { .. })
        ));
        assert_eq!(sandbox_count(&fx.work), 0);
    }

    #[tokio::test]
    async fn timeout_fails_one_unit_without_blocking_the_next() {
        let fx = fixture(Duration::from_millis(300));
        let request = CompileRequest {
            includes: BTreeMap::new(),
            plugins: vec![plugin("slow", "SLOW"), plugin("fast", "ok")],
        };

        let result = fx.service.process_request(request).await.expect("batch");

        let slow = &result.results[0];
        assert_eq!(slow.failure, Some(FailureKind::Timeout));
        assert!(slow.diagnostics.errors[0].message.contains("timed out"));
        assert!(result.results[1].success);
    }

    #[tokio::test]
    async fn duplicate_names_build_in_separate_directories() {
        let fx = fixture(Duration::from_secs(10));
        let request = CompileRequest {
            includes: BTreeMap::new(),
            plugins: vec![plugin("same", "first"), plugin("same", "second")],
        };

        let result = fx.service.process_request(request).await.expect("batch");

        assert_eq!(result.successful, 2);
        assert_eq!(result.results[0].size, "first".len() as u64);
        assert_eq!(result.results[1].size, "second".len() as u64);
    }

    /// Prints every include directory it is given and the files inside, failing if
    /// one does not exist from its working directory.
    const INCLUDE_LISTING_COMPILER: &str = r#"#!/bin/sh
PATH=/usr/bin:/bin
src="$1"
out="${2#-o}"
shift 2
for arg in "$@"; do
  dir="${arg#-i}"
  echo "include-dir $dir"
  if [ ! -d "$dir" ]; then
    echo "missing include dir: $dir"
    exit 1
  fi
  for file in "$dir"/*; do
    [ -e "$file" ] && echo "include-file $file"
  done
done
cp "$src" "$out"
"#;

    #[tokio::test]
    async fn include_dirs_are_official_then_shared_then_unit_with_relative_work_dir() {
        let dir = tempfile::Builder::new()
            .prefix(".amxforge-include-order-")
            .tempdir_in(".")
            .expect("temp dir in working directory");
        let relative_root = PathBuf::from(dir.path().file_name().expect("temp dir name"));
        let work = relative_root.join("work");
        assert!(work.is_relative());
        let official = std::path::absolute(relative_root.join("include")).expect("absolute");
        let fx = fixture_with(dir, work, INCLUDE_LISTING_COMPILER, Duration::from_secs(10));

        let request = CompileRequest {
            includes: BTreeMap::from([("shared.inc".to_string(), "#define SHARED".to_string())]),
            plugins: vec![PluginSource {
                name: Some("ordered".to_string()),
                code: "ok".to_string(),
                includes: BTreeMap::from([("unit.inc".to_string(), "#define UNIT".to_string())]),
            }],
        };

        let result = fx.service.process_request(request).await.expect("batch");

        let unit = &result.results[0];
        assert!(unit.success, "compiler log: {}", unit.log);

        let sandbox = fx.service.sandboxes.sandbox_path(result.id);
        assert!(sandbox.is_absolute());
        let shared = sandbox.join("shared_include");
        let unit_dir = sandbox.join("build_0").join("include");

        let dirs: Vec<PathBuf> = unit
            .log
            .lines()
            .filter_map(|line| line.strip_prefix("include-dir "))
            .map(PathBuf::from)
            .collect();
        assert_eq!(dirs, vec![official, shared.clone(), unit_dir.clone()]);

        let files: Vec<PathBuf> = unit
            .log
            .lines()
            .filter_map(|line| line.strip_prefix("include-file "))
            .map(PathBuf::from)
            .collect();
        assert_eq!(
            files,
            vec![shared.join("shared.inc"), unit_dir.join("unit.inc")]
        );
        assert_eq!(sandbox_count(fx.service.sandboxes.work_dir()), 0);
    }
}
