use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Connection closed by peer")]
    Closed,
    #[error("Transport I/O error: {0}")]
    Io(String),
    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// Byte-level channel to the target. One transport belongs to one session.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Waits at most `timeout` for the next response.
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Opens a fresh transport for each session of a campaign.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, session_id: usize) -> Result<Box<dyn Transport>, TransportError>;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        (**self).receive(timeout).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        (**self).close().await
    }
}
