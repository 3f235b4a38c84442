use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use uuid::Uuid;

const ARTIFACT_SUFFIX: &str = ".png.gz";
const UPLOAD_SUFFIX: &str = ".upload";

// `None` only if the pattern fails to compile, in which case every name is rejected.
static SCREENSHOT_FILENAME: Lazy<Option<Regex>> = Lazy::new(|| {
    RegexBuilder::new(
        r"^[0-9A-F]{8}-[0-9A-F]{4}-4[0-9A-F]{3}-[89AB][0-9A-F]{3}-[0-9A-F]{12}\.png$",
    )
    .case_insensitive(true)
    .build()
    .ok()
});

#[derive(Debug, thiserror::Error)]
pub enum ScreenshotError {
    #[error("screenshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("compression task failed: {0}")]
    Task(String),
}

/// Accepts only `{uuid-v4}.png`, case-insensitive.
pub fn is_valid_filename(filename: &str) -> bool {
    SCREENSHOT_FILENAME
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(filename))
}

/// Uploaded file waiting for compression. Removed from disk when dropped
/// unless [`TempUpload::remove`] already ran.
#[derive(Debug)]
pub struct TempUpload {
    path: PathBuf,
    armed: bool,
}

impl TempUpload {
    /// Creates an empty, uniquely named upload file under `dir`.
    pub async fn create(dir: &Path) -> io::Result<(Self, tokio::fs::File)> {
        let path = dir.join(format!("{}{UPLOAD_SUFFIX}", Uuid::new_v4()));
        let file = tokio::fs::File::create(&path).await?;
        Ok((Self { path, armed: true }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.armed = false;
        if let Err(error) = tokio::fs::remove_file(&self.path).await
            && error.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                target: "probe_ingest.screenshots",
                path = %self.path.display(),
                error = %error,
                "failed to remove temporary upload",
            );
        }
    }
}

impl Drop for TempUpload {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Directory of gzip-compressed screenshot artifacts named `{uuid}.png.gz`.
#[derive(Debug, Clone)]
pub struct ScreenshotStore {
    dir: PathBuf,
}

impl ScreenshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub fn artifact_path(&self, artifact_id: Uuid) -> PathBuf {
        self.dir.join(format!("{artifact_id}{ARTIFACT_SUFFIX}"))
    }

    /// Streams `upload` through gzip into the artifact for `artifact_id`.
    ///
    /// The upload is deleted once the stream ends, whatever the outcome. A
    /// partially written artifact is removed on failure.
    pub async fn compress(
        &self,
        artifact_id: Uuid,
        upload: TempUpload,
    ) -> Result<PathBuf, ScreenshotError> {
        let destination = self.artifact_path(artifact_id);
        let source = upload.path().to_path_buf();
        let target = destination.clone();
        let outcome = tokio::task::spawn_blocking(move || gzip_file(&source, &target)).await;
        upload.remove().await;

        let result = match outcome {
            Ok(Ok(())) => return Ok(destination),
            Ok(Err(error)) => ScreenshotError::Io(error),
            Err(error) => ScreenshotError::Task(error.to_string()),
        };
        if let Err(error) = tokio::fs::remove_file(&destination).await
            && error.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(
                target: "probe_ingest.screenshots",
                path = %destination.display(),
                error = %error,
                "failed to remove partial screenshot artifact",
            );
        }
        Err(result)
    }

    /// Compressed bytes for `filename` (`{uuid}.png`). Malformed names and
    /// missing artifacts both read as `None`.
    pub async fn read_artifact(&self, filename: &str) -> Option<Vec<u8>> {
        if !is_valid_filename(filename) {
            return None;
        }
        let path = self.dir.join(format!("{filename}.gz"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => None,
            Err(error) => {
                tracing::warn!(
                    target: "probe_ingest.screenshots",
                    path = %path.display(),
                    error = %error,
                    "failed to read screenshot artifact",
                );
                None
            }
        }
    }
}

fn gzip_file(source: &Path, target: &Path) -> io::Result<()> {
    let mut input = BufReader::new(File::open(source)?);
    let output = BufWriter::new(File::create(target)?);
    let mut encoder = GzEncoder::new(output, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()
}
