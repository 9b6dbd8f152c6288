//! Invocation of the external `amxxpc` compiler.
//!
//! The child runs inside its unit's build directory with an empty environment apart
//! from `LD_LIBRARY_PATH`. Standard output and standard error share one anonymous temp
//! file so the captured log keeps the order in which the compiler wrote it.

use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use metrics::histogram;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt},
    process::Command,
};
use tracing::{debug, warn};

use crate::config::CompilerSettings;

const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[derive(Debug, Error)]
pub enum CompilerError {
    #[error("failed to start compiler `{path}`: {source}")]
    Spawn { path: PathBuf, source: io::Error },
    #[error("failed to capture compiler output: {0}")]
    Capture(io::Error),
    #[error("failed waiting for compiler: {0}")]
    Wait(io::Error),
}

/// One compiler call for one unit.
#[derive(Debug, Clone)]
pub struct CompileJob<'a> {
    pub build_dir: &'a Path,
    pub source_filename: &'a str,
    pub output_filename: &'a str,
    /// Searched in order; the first directory containing a requested include wins.
    pub include_dirs: &'a [PathBuf],
}

impl CompileJob<'_> {
    pub fn output_path(&self) -> PathBuf {
        self.build_dir.join(self.output_filename)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilerRun {
    Finished {
        exit_code: Option<i32>,
        output: String,
        output_present: bool,
    },
    /// The deadline passed and the child was killed. Its partial output is discarded.
    TimedOut { after: Duration },
}

impl CompilerRun {
    /// Exit status zero and the binary on disk. Neither alone counts.
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            Self::Finished {
                exit_code: Some(0),
                output_present: true,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct Compiler {
    executable: PathBuf,
    library_dir: PathBuf,
    official_include_dir: PathBuf,
    timeout: Duration,
}

impl Compiler {
    /// Paths are made absolute up front because the child's working directory is the
    /// build directory, not ours.
    pub fn new(settings: &CompilerSettings) -> io::Result<Self> {
        Ok(Self {
            executable: std::path::absolute(&settings.executable)?,
            library_dir: std::path::absolute(&settings.library_dir)?,
            official_include_dir: std::path::absolute(&settings.include_dir)?,
            timeout: settings.timeout,
        })
    }

    pub fn official_include_dir(&self) -> &Path {
        &self.official_include_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn compile(&self, job: &CompileJob<'_>) -> Result<CompilerRun, CompilerError> {
        let started_at = Instant::now();

        let log = tempfile::tempfile_in(job.build_dir).map_err(CompilerError::Capture)?;
        let stdout = log.try_clone().map_err(CompilerError::Capture)?;
        let stderr = log.try_clone().map_err(CompilerError::Capture)?;

        let mut command = Command::new(&self.executable);
        command
            .arg(job.source_filename)
            .arg(prefixed("-o", job.output_filename.as_ref()))
            .args(
                job.include_dirs
                    .iter()
                    .map(|dir| prefixed("-i", dir.as_os_str())),
            )
            .current_dir(job.build_dir)
            .env_clear()
            .env(LIBRARY_PATH_VAR, &self.library_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| CompilerError::Spawn {
            path: self.executable.clone(),
            source,
        })?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.map_err(CompilerError::Wait)?,
            Err(_) => {
                if let Err(err) = child.start_kill() {
                    warn!(
                        target = "amxforge::infra::compiler",
                        error = %err,
                        "failed to kill timed-out compiler"
                    );
                }
                // Reap so no zombie outlives the call.
                if let Err(err) = child.wait().await {
                    warn!(
                        target = "amxforge::infra::compiler",
                        error = %err,
                        "failed to reap timed-out compiler"
                    );
                }
                let elapsed = started_at.elapsed();
                histogram!("amxforge_compile_ms").record(elapsed.as_secs_f64() * 1000.0);
                warn!(
                    target = "amxforge::infra::compiler",
                    source = job.source_filename,
                    timeout_secs = self.timeout.as_secs(),
                    "compiler timed out"
                );
                return Ok(CompilerRun::TimedOut { after: self.timeout });
            }
        };

        let output = read_log(log).await.map_err(CompilerError::Capture)?;
        let output_present = tokio::fs::try_exists(job.output_path())
            .await
            .unwrap_or(false);

        let elapsed = started_at.elapsed();
        histogram!("amxforge_compile_ms").record(elapsed.as_secs_f64() * 1000.0);
        debug!(
            target = "amxforge::infra::compiler",
            source = job.source_filename,
            exit_code = status.code().map(i64::from).unwrap_or(-1),
            output_present,
            elapsed_ms = elapsed.as_millis() as u64,
            "compiler finished"
        );

        Ok(CompilerRun::Finished {
            exit_code: status.code(),
            output,
            output_present,
        })
    }
}

fn prefixed(flag: &str, value: &std::ffi::OsStr) -> OsString {
    let mut arg = OsString::from(flag);
    arg.push(value);
    arg
}

async fn read_log(log: std::fs::File) -> io::Result<String> {
    let mut file = tokio::fs::File::from_std(log);
    file.seek(io::SeekFrom::Start(0)).await?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn make_executable(path: &Path) {
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("set perms");
    }

    fn fake_compiler(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-amxxpc");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        make_executable(&path);
        path
    }

    fn compiler(executable: PathBuf, library_dir: &Path, timeout: Duration) -> Compiler {
        Compiler::new(&CompilerSettings {
            executable,
            library_dir: library_dir.to_path_buf(),
            include_dir: library_dir.join("include"),
            timeout,
            concurrency: std::num::NonZeroU32::MIN,
        })
        .expect("compiler")
    }

    #[tokio::test]
    async fn passes_contract_arguments_and_environment() {
        let dir = TempDir::new().expect("temp dir");
        let build = dir.path().join("build_0");
        fs::create_dir_all(&build).expect("build dir");
        let script = fake_compiler(
            dir.path(),
            r#"echo "args:$*"
echo "lib:$LD_LIBRARY_PATH"
echo "home:${HOME:-unset}"
echo "cwd:$(pwd)"
for arg in "$@"; do
  case "$arg" in
    -o*) printf 'AMX' > "${arg#-o}" ;;
  esac
done"#,
        );

        let compiler = compiler(script, dir.path(), Duration::from_secs(5));
        let includes = vec![PathBuf::from("/official"), PathBuf::from("/shared")];
        let job = CompileJob {
            build_dir: &build,
            source_filename: "demo.sma",
            output_filename: "demo.amxx",
            include_dirs: &includes,
        };

        let run = compiler.compile(&job).await.expect("compile");
        assert!(run.succeeded());
        let CompilerRun::Finished { output, .. } = run else {
            panic!("expected finished run");
        };
        assert!(output.contains("args:demo.sma -odemo.amxx -i/official -i/shared"));
        assert!(output.contains(&format!("lib:{}", dir.path().display())));
        assert!(output.contains("home:unset"));
        assert!(output.contains("build_0"));
        assert_eq!(fs::read(build.join("demo.amxx")).expect("binary"), b"AMX");
    }

    #[tokio::test]
    async fn interleaves_stdout_and_stderr() {
        let dir = TempDir::new().expect("temp dir");
        let script = fake_compiler(
            dir.path(),
            "echo one\necho two >&2\necho three\nexit 1",
        );
        let compiler = compiler(script, dir.path(), Duration::from_secs(5));
        let job = CompileJob {
            build_dir: dir.path(),
            source_filename: "a.sma",
            output_filename: "a.amxx",
            include_dirs: &[],
        };

        let run = compiler.compile(&job).await.expect("compile");
        assert_eq!(
            run,
            CompilerRun::Finished {
                exit_code: Some(1),
                output: "one\ntwo\nthree\n".to_string(),
                output_present: false,
            }
        );
        assert!(!run.succeeded());
    }

    #[tokio::test]
    async fn zero_exit_without_binary_is_not_success() {
        let dir = TempDir::new().expect("temp dir");
        let script = fake_compiler(dir.path(), "exit 0");
        let compiler = compiler(script, dir.path(), Duration::from_secs(5));
        let job = CompileJob {
            build_dir: dir.path(),
            source_filename: "a.sma",
            output_filename: "a.amxx",
            include_dirs: &[],
        };

        let run = compiler.compile(&job).await.expect("compile");
        assert!(!run.succeeded());
    }

    #[tokio::test]
    async fn kills_child_after_timeout() {
        let dir = TempDir::new().expect("temp dir");
        let script = fake_compiler(dir.path(), "exec /bin/sleep 30");
        let compiler = compiler(script, dir.path(), Duration::from_millis(200));
        let job = CompileJob {
            build_dir: dir.path(),
            source_filename: "slow.sma",
            output_filename: "slow.amxx",
            include_dirs: &[],
        };

        let started = Instant::now();
        let run = compiler.compile(&job).await.expect("compile");
        assert!(matches!(run, CompilerRun::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let dir = TempDir::new().expect("temp dir");
        let compiler = compiler(
            dir.path().join("does-not-exist"),
            dir.path(),
            Duration::from_secs(1),
        );
        let job = CompileJob {
            build_dir: dir.path(),
            source_filename: "a.sma",
            output_filename: "a.amxx",
            include_dirs: &[],
        };

        let err = compiler.compile(&job).await.expect_err("spawn fails");
        assert!(matches!(err, CompilerError::Spawn { .. }));
    }
}
