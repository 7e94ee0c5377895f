//! POSIX FIFO sink

use super::{PipeSink, SinkError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::{debug, warn};

/// FIFO backed pipe sink
pub struct FifoSink {
    path: PathBuf,
    writer: Option<pipe::Sender>,
    created: bool,
}

impl FifoSink {
    /// Sink at `path`; nothing touches the filesystem until `create`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
            created: false,
        }
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }

    fn is_fifo(path: &Path) -> bool {
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_fifo())
    }
}

#[async_trait]
impl PipeSink for FifoSink {
    async fn create(&mut self) -> Result<(), SinkError> {
        match nix::unistd::mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR) {
            Ok(()) => debug!(path = %self.display(), "fifo created"),
            Err(Errno::EEXIST) if Self::is_fifo(&self.path) => {
                debug!(path = %self.display(), "fifo already exists");
            }
            Err(errno) => {
                return Err(SinkError::Create {
                    path: self.display(),
                    source: io::Error::from(errno),
                });
            }
        }
        self.created = true;
        Ok(())
    }

    async fn open_for_write(&mut self) -> Result<(), SinkError> {
        if self.writer.is_some() {
            return Ok(());
        }
        let path = self.path.clone();
        let open_err = |source| SinkError::Open {
            path: self.display(),
            source,
        };

        // A write-only FIFO open blocks until the reader shows up.
        let file = tokio::task::spawn_blocking(move || OpenOptions::new().write(true).open(path))
            .await
            .map_err(|e| open_err(io::Error::other(e)))?
            .map_err(open_err)?;
        let sender = pipe::Sender::from_file(file).map_err(open_err)?;

        debug!(path = %self.display(), "capture reader attached");
        self.writer = Some(sender);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotOpen)?;
        let result = async {
            writer.write_all(data).await?;
            writer.flush().await
        }
        .await;

        result.map_err(|e| {
            let err = SinkError::from_write(e);
            if matches!(err, SinkError::ReaderGone) {
                self.writer = None;
            }
            err
        })
    }

    async fn remove(&mut self) -> Result<(), SinkError> {
        self.writer = None;
        if !self.created {
            return Ok(());
        }
        self.created = false;

        if Self::is_fifo(&self.path) {
            // Opening the read side releases a writer still blocked in open().
            if let Err(e) = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
            {
                warn!(path = %self.display(), error = %e, "could not release pending fifo open");
            }
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.display(), "fifo removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::Io(e)),
        }
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn path(&self) -> String {
        self.display()
    }
}
