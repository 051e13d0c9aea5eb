//! Error types for the agent.

use reqwest::StatusCode;
use ssh_agent_lib::error::AgentError;

/// Failures talking to a relying party, or decoding what it sent back.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid relying party URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("relying party returned {status} for {endpoint}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
    },

    #[error("missing '{0}' in relying party response")]
    MissingField(&'static str),

    #[error("malformed signature: {0}")]
    Signature(String),

    #[error("bearer token: {0}")]
    Token(#[from] tkey_core::TokenError),

    #[error("signing request cancelled")]
    Cancelled,

    #[error("no confirmation after {attempts} attempts")]
    ConfirmationTimeout { attempts: u32 },
}

impl RemoteError {
    /// The relying party's long-poll expired without an answer.
    pub fn is_request_timeout(&self) -> bool {
        matches!(
            self,
            Self::Status { status, .. } if *status == StatusCode::REQUEST_TIMEOUT
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("agent is locked")]
    Locked,

    #[error("agent is already locked")]
    AlreadyLocked,

    #[error("agent is not locked")]
    NotLocked,

    #[error("incorrect passphrase")]
    WrongPassphrase,

    #[error("signer for public key not found")]
    SignerNotFound,

    #[error("not supported: remote identities are managed in the config file")]
    NotSupported,

    #[error("keyring state lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<KeyringError> for AgentError {
    fn from(err: KeyringError) -> Self {
        AgentError::other(err)
    }
}

/// Failures of the composed keyring: either half can be at fault.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Primary(#[from] KeyringError),

    #[error("backend agent: {0}")]
    Backend(#[from] AgentError),
}

impl From<ProxyError> for AgentError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Backend(inner) => inner,
            primary => AgentError::other(primary),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("socket activation: ${0} is not set")]
    MissingVar(&'static str),

    #[error("socket activation: ${name} has invalid value '{value}'")]
    InvalidVar { name: &'static str, value: String },

    #[error("socket activation: LISTEN_PID {expected} does not match our pid {actual}")]
    PidMismatch { expected: u32, actual: u32 },

    #[error("socket activation: no file descriptors passed")]
    NoDescriptors,

    #[error("listen on {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
}
