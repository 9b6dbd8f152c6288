//! Packaging of compiled plugins into one downloadable `.tar.gz` per batch.

use std::{
    io,
    path::{Path, PathBuf},
};

use flate2::{Compression, write::GzEncoder};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::filenames::UnitName;

pub const ARCHIVE_PREFIX: &str = "compiled_plugins_";
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";
const ENTRY_MODE: u32 = 0o644;

/// Archive name for a batch. Lookups rebuild it from the identifier alone.
pub fn archive_filename(batch_id: Uuid) -> String {
    format!("{ARCHIVE_PREFIX}{batch_id}{ARCHIVE_EXTENSION}")
}

/// Compiled bytes of one successful unit.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub name: UnitName,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArchive {
    pub filename: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("failed to write archive: {0}")]
    Io(#[from] io::Error),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct ArtifactPackager {
    downloads_dir: PathBuf,
}

impl ArtifactPackager {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn archive_path(&self, batch_id: Uuid) -> PathBuf {
        self.downloads_dir.join(archive_filename(batch_id))
    }

    /// Write one entry `<name>.amxx` per artifact. The archive appears under its final
    /// name only once it is complete.
    pub async fn pack(
        &self,
        batch_id: Uuid,
        artifacts: Vec<Artifact>,
    ) -> Result<PackedArchive, PackError> {
        let filename = archive_filename(batch_id);
        let path = self.downloads_dir.join(&filename);
        let dir = self.downloads_dir.clone();
        let target = path.clone();
        let entries = artifacts.len();

        let size_bytes =
            tokio::task::spawn_blocking(move || write_archive(&dir, &target, &artifacts))
                .await??;

        info!(
            target = "amxforge::infra::archive",
            batch_id = %batch_id,
            filename = %filename,
            entries,
            size_bytes,
            "archive written"
        );

        Ok(PackedArchive {
            filename,
            path,
            size_bytes,
        })
    }
}

fn write_archive(dir: &Path, target: &Path, artifacts: &[Artifact]) -> io::Result<u64> {
    std::fs::create_dir_all(dir)?;

    let staging = tempfile::Builder::new()
        .prefix(".staging_")
        .tempfile_in(dir)?;
    let encoder = GzEncoder::new(staging, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mtime = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    for artifact in artifacts {
        let mut header = tar::Header::new_gnu();
        header.set_size(artifact.bytes.len() as u64);
        header.set_mode(ENTRY_MODE);
        header.set_mtime(mtime);
        header.set_cksum();
        builder.append_data(
            &mut header,
            artifact.name.binary_filename(),
            artifact.bytes.as_slice(),
        )?;
    }

    let staging = builder.into_inner()?.finish()?;
    staging.as_file().sync_all()?;
    let file = staging.persist(target).map_err(|err| err.error)?;
    Ok(file.metadata()?.len())
}
