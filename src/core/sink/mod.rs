//! Capture output pipe
//!
//! The analyzer attaches to a named pipe and reads a live capture stream.
//! - POSIX: a FIFO created with `mkfifo`
//! - Windows: a named pipe server (`\\.\pipe\...`)

#[cfg(unix)]
mod fifo;
#[cfg(windows)]
mod named_pipe;

#[cfg(unix)]
pub use fifo::FifoSink;
#[cfg(windows)]
pub use named_pipe::NamedPipeSink;

use async_trait::async_trait;
use std::io;
use thiserror::Error;

/// Default pipe location when none is given
#[cfg(unix)]
pub const DEFAULT_PIPE_PATH: &str = "/tmp/fcatsniffer";
/// Default pipe location when none is given
#[cfg(windows)]
pub const DEFAULT_PIPE_PATH: &str = r"\\.\pipe\fcatsniffer";

/// Pipe sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// Pipe object could not be provisioned
    #[error("failed to create pipe {path}: {source}")]
    Create {
        /// Pipe path
        path: String,
        /// Cause
        source: io::Error,
    },

    /// Waiting for the reader failed
    #[error("failed to open pipe {path}: {source}")]
    Open {
        /// Pipe path
        path: String,
        /// Cause
        source: io::Error,
    },

    /// The reader closed its end
    #[error("capture reader went away")]
    ReaderGone,

    /// Write before `open_for_write`
    #[error("pipe is not open")]
    NotOpen,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SinkError {
    /// Classify a write error
    pub(crate) fn from_write(e: io::Error) -> Self {
        if is_reader_gone(&e) {
            Self::ReaderGone
        } else {
            Self::Io(e)
        }
    }
}

fn is_reader_gone(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::BrokenPipe {
        return true;
    }
    // ERROR_NO_DATA / ERROR_PIPE_NOT_CONNECTED
    cfg!(windows) && matches!(e.raw_os_error(), Some(232 | 233))
}

/// Named byte-stream transport a capture reader attaches to
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PipeSink: Send {
    /// Provision the pipe; no-op if it already exists
    async fn create(&mut self) -> Result<(), SinkError>;

    /// Wait until a reader attaches
    async fn open_for_write(&mut self) -> Result<(), SinkError>;

    /// Write and flush. A vanished reader closes the sink and returns
    /// [`SinkError::ReaderGone`].
    async fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;

    /// Close and unlink; releases a pending `open_for_write`
    async fn remove(&mut self) -> Result<(), SinkError>;

    /// Reader attached and writable
    fn is_open(&self) -> bool;

    /// Pipe path
    fn path(&self) -> String;
}

/// Platform pipe sink at `path`
pub fn platform_sink(path: &str) -> Box<dyn PipeSink> {
    #[cfg(unix)]
    {
        Box::new(FifoSink::new(path))
    }
    #[cfg(windows)]
    {
        Box::new(NamedPipeSink::new(path))
    }
}
