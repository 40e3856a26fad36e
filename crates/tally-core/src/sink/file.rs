//! Local filesystem output artifact.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::RecordSink;
use crate::codec::LINE_TERMINATOR;
use crate::error::{Result, TallyError};
use crate::types::Record;

/// Well-known path of the output artifact, relative to the working directory.
pub const DEFAULT_OUTPUT_PATH: &str = "numbers.log";

/// Byte stream that can make written data durable.
pub trait DurableWrite: AsyncWrite + Unpin + Send {
    /// Push written data to stable storage.
    fn sync(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

impl DurableWrite for File {
    async fn sync(&mut self) -> io::Result<()> {
        self.sync_all().await
    }
}

/// Append-only text file holding one unique record per line.
///
/// Records are written without leading zeros, one per line, and flushed
/// after every line. A failed append leaves nothing buffered, so retrying
/// the record cannot write it twice.
pub struct FileSink<W = File> {
    path: PathBuf,
    writer: Option<BufWriter<W>>,
}

impl FileSink<File> {
    /// Create a fresh artifact at `path`.
    ///
    /// Any file already at `path` is deleted first, so a run never appends
    /// to stale data. The file is then held open for append until
    /// [`RecordSink::close`].
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if remove_stale(&path).await? {
            info!(path = %path.display(), "Removed existing output artifact");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        info!(path = %path.display(), "Created output artifact");

        Ok(Self::with_writer(path, file))
    }
}

impl<W: DurableWrite> FileSink<W> {
    /// Wrap an already opened writer. `path` is only used for logging.
    pub fn with_writer(path: impl Into<PathBuf>, writer: W) -> Self {
        Self {
            path: path.into(),
            writer: Some(BufWriter::new(writer)),
        }
    }

    /// Path of the artifact.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the artifact is still open for append.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }
}

async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut BufWriter<W>,
    line: &[u8],
) -> io::Result<()> {
    writer.write_all(line).await?;
    writer.flush().await
}

impl<W: DurableWrite> RecordSink for FileSink<W> {
    async fn append(&mut self, record: Record) -> Result<()> {
        let mut writer = self.writer.take().ok_or_else(|| {
            TallyError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output artifact is closed",
            ))
        })?;

        let line = format!("{record}{LINE_TERMINATOR}");
        match write_line(&mut writer, line.as_bytes()).await {
            Ok(()) => {
                self.writer = Some(writer);
                debug!(%record, "Record written to output artifact");
                Ok(())
            }
            Err(e) => {
                // Unflushed bytes would be written again by the retry.
                let discarded = writer.buffer().len();
                self.writer = Some(BufWriter::new(writer.into_inner()));
                debug!(%record, discarded, "Discarded unflushed bytes after failed append");
                Err(TallyError::Io(e))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_mut().sync().await?;
            info!(path = %self.path.display(), "Closed output artifact");
        }
        Ok(())
    }
}

/// Delete a leftover artifact. Returns whether a file was removed.
async fn remove_stale(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Existing output artifact could not be deleted");
            Err(TallyError::Io(e))
        }
    }
}
