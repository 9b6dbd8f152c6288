//! Per-batch build sandboxes.
//!
//! Layout under the work directory:
//!
//! ```text
//! amxx_build_<batch id>/
//!   shared_include/
//!   build_0/include/
//!   build_1/include/
//!   ...
//! ```
//!
//! Build directories are positional, so two units with the same sanitized name never
//! collide. A [`Sandbox`] removes its tree when dropped unless [`Sandbox::destroy`]
//! already did.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::filenames::is_include_filename;

/// Directory-name prefix shared by every sandbox root; the reclaimer matches on it.
pub const SANDBOX_PREFIX: &str = "amxx_build_";
const SHARED_INCLUDE_DIR: &str = "shared_include";
const UNIT_INCLUDE_DIR: &str = "include";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create directory `{path}`: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("failed to write `{path}`: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read `{path}`: {source}")]
    Read { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct SandboxManager {
    work_dir: PathBuf,
}

impl SandboxManager {
    /// The work directory is made absolute here: the compiler runs inside a build
    /// directory and receives sandbox include paths verbatim.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let work_dir = std::path::absolute(&work_dir).unwrap_or(work_dir);
        Self { work_dir }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Root path a batch's sandbox will occupy. Derived only from the identifier.
    pub fn sandbox_path(&self, batch_id: Uuid) -> PathBuf {
        self.work_dir.join(format!("{SANDBOX_PREFIX}{batch_id}"))
    }

    /// Create the sandbox root and its shared include directory.
    pub async fn create(&self, batch_id: Uuid) -> Result<Sandbox, SandboxError> {
        let root = self.sandbox_path(batch_id);
        let shared = root.join(SHARED_INCLUDE_DIR);
        create_dir_all(&shared).await?;

        // Armed from here on: a failure below still removes the partial tree.
        let sandbox = Sandbox { root, armed: true };
        debug!(
            target = "amxforge::infra::sandbox",
            batch_id = %batch_id,
            path = %sandbox.root.display(),
            "sandbox created"
        );
        Ok(sandbox)
    }
}

/// An exclusively-owned sandbox tree.
#[derive(Debug)]
pub struct Sandbox {
    root: PathBuf,
    armed: bool,
}

impl Sandbox {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shared_include_dir(&self) -> PathBuf {
        self.root.join(SHARED_INCLUDE_DIR)
    }

    /// Create `build_<index>/include` for one unit.
    pub async fn create_build_dir(&self, index: usize) -> Result<BuildDir, SandboxError> {
        let path = self.root.join(format!("build_{index}"));
        let include_dir = path.join(UNIT_INCLUDE_DIR);
        create_dir_all(&include_dir).await?;
        Ok(BuildDir { path, include_dir })
    }

    /// Remove the whole tree. Never fails; problems are logged.
    pub async fn destroy(mut self) {
        self.armed = false;
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => debug!(
                target = "amxforge::infra::sandbox",
                path = %self.root.display(),
                "sandbox removed"
            ),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "amxforge::infra::sandbox",
                path = %self.root.display(),
                error = %err,
                "failed to remove sandbox"
            ),
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "amxforge::infra::sandbox",
                path = %self.root.display(),
                error = %err,
                "failed to remove sandbox on drop"
            ),
        }
    }
}

/// One unit's build directory and its private include directory.
#[derive(Debug, Clone)]
pub struct BuildDir {
    pub path: PathBuf,
    pub include_dir: PathBuf,
}

/// Write include files into `dir`, skipping names that are unsafe or lack the include
/// extension. Returns how many files were written.
pub async fn write_includes(
    dir: &Path,
    includes: &BTreeMap<String, String>,
) -> Result<usize, SandboxError> {
    let mut written = 0;
    for (name, contents) in includes {
        if !is_include_filename(name) {
            debug!(
                target = "amxforge::infra::sandbox",
                name = %name,
                "skipping include with invalid filename"
            );
            continue;
        }
        write_file(&dir.join(name), contents).await?;
        written += 1;
    }
    Ok(written)
}

pub async fn write_file(path: &Path, contents: &str) -> Result<(), SandboxError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|source| SandboxError::Write {
            path: path.to_path_buf(),
            source,
        })
}

async fn create_dir_all(path: &Path) -> Result<(), SandboxError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| SandboxError::Create {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_layout_and_destroys_it() {
        let work = TempDir::new().expect("temp dir");
        let manager = SandboxManager::new(work.path());
        let id = Uuid::new_v4();

        let sandbox = manager.create(id).await.expect("sandbox");
        assert_eq!(sandbox.root(), manager.sandbox_path(id));
        assert!(sandbox.shared_include_dir().is_dir());

        let first = sandbox.create_build_dir(0).await.expect("build dir");
        let second = sandbox.create_build_dir(1).await.expect("build dir");
        assert!(first.include_dir.is_dir());
        assert_ne!(first.path, second.path);

        let root = sandbox.root().to_path_buf();
        sandbox.destroy().await;
        assert!(!root.exists());
    }

    #[test]
    fn relative_work_dir_is_resolved_against_the_process_directory() {
        let manager = SandboxManager::new("relative/work");
        let id = Uuid::new_v4();

        assert!(manager.work_dir().is_absolute());
        assert!(manager.work_dir().ends_with("relative/work"));
        assert!(manager.sandbox_path(id).is_absolute());
    }

    #[tokio::test]
    async fn destroy_tolerates_missing_tree() {
        let work = TempDir::new().expect("temp dir");
        let manager = SandboxManager::new(work.path());
        let sandbox = manager.create(Uuid::new_v4()).await.expect("sandbox");

        std::fs::remove_dir_all(sandbox.root()).expect("remove early");
        sandbox.destroy().await;
    }

    #[tokio::test]
    async fn drop_removes_tree() {
        let work = TempDir::new().expect("temp dir");
        let manager = SandboxManager::new(work.path());
        let root = {
            let sandbox = manager.create(Uuid::new_v4()).await.expect("sandbox");
            sandbox.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn write_includes_skips_invalid_names() {
        let work = TempDir::new().expect("temp dir");
        let includes = BTreeMap::from([
            ("good.inc".to_string(), "#define GOOD".to_string()),
            ("../evil.inc".to_string(), "x".to_string()),
            ("no_extension".to_string(), "x".to_string()),
            ("with space.inc".to_string(), "x".to_string()),
        ]);

        let written = write_includes(work.path(), &includes)
            .await
            .expect("write includes");

        assert_eq!(written, 1);
        assert!(work.path().join("good.inc").is_file());
        assert!(!work.path().join("no_extension").exists());
        assert!(!work.path().parent().expect("parent").join("evil.inc").exists());
    }
}
