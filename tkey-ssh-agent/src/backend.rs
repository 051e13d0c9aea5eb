//! Connections to the second agent a [`ProxyKeyring`](crate::ProxyKeyring)
//! forwards to.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::error::AgentError;
use tokio::net::UnixStream;
use tracing::debug;

/// Opens a session with the backend agent.
///
/// Called once per forwarded operation, so an unreachable backend fails
/// only the operations in flight.
#[async_trait]
pub trait BackendConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Session>, AgentError>;

    /// Where the backend lives, for log messages.
    fn describe(&self) -> String;
}

/// A conventional agent listening on a Unix socket (e.g. `ssh-agent`).
#[derive(Debug, Clone)]
pub struct UnixSocketBackend {
    path: PathBuf,
}

impl UnixSocketBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BackendConnector for UnixSocketBackend {
    async fn connect(&self) -> Result<Box<dyn Session>, AgentError> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            debug!(path = %self.path.display(), error = %e, "backend agent unreachable");
            AgentError::IO(e)
        })?;
        Ok(Box::new(Client::new(stream)))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
