//! Windows named pipe sink

use super::{PipeSink, SinkError};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::windows::named_pipe::{NamedPipeServer, PipeMode, ServerOptions};
use tracing::debug;

/// Named pipe server sink
pub struct NamedPipeSink {
    path: String,
    server: Option<NamedPipeServer>,
    connected: bool,
}

impl NamedPipeSink {
    /// Sink at `path` (`\\.\pipe\name`)
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            server: None,
            connected: false,
        }
    }
}

#[async_trait]
impl PipeSink for NamedPipeSink {
    async fn create(&mut self) -> Result<(), SinkError> {
        if self.server.is_some() {
            return Ok(());
        }
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .pipe_mode(PipeMode::Byte)
            .access_inbound(false)
            .create(&self.path)
            .map_err(|source| SinkError::Create {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path, "named pipe created");
        self.server = Some(server);
        Ok(())
    }

    async fn open_for_write(&mut self) -> Result<(), SinkError> {
        if self.connected {
            return Ok(());
        }
        let server = self.server.as_ref().ok_or(SinkError::NotOpen)?;
        server.connect().await.map_err(|source| SinkError::Open {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path, "capture reader attached");
        self.connected = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SinkError> {
        if !self.connected {
            return Err(SinkError::NotOpen);
        }
        let server = self.server.as_mut().ok_or(SinkError::NotOpen)?;
        let result = async {
            server.write_all(data).await?;
            server.flush().await
        }
        .await;

        result.map_err(|e| {
            let err = SinkError::from_write(e);
            if matches!(err, SinkError::ReaderGone) {
                self.connected = false;
                self.server = None;
            }
            err
        })
    }

    async fn remove(&mut self) -> Result<(), SinkError> {
        if let Some(server) = self.server.take() {
            if self.connected {
                let _ = server.disconnect();
            }
            debug!(path = %self.path, "named pipe closed");
        }
        self.connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connected
    }

    fn path(&self) -> String {
        self.path.clone()
    }
}
