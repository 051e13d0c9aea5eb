//! SSH agent whose identities are signed for by a remote trust authority.
//!
//! No private key is held locally.  Each configured identity is backed by a
//! [`RemoteSigner`] that asks the identity's relying party for a signature
//! and waits for the user to confirm it on a paired device.
//!
//! # Architecture
//!
//! ```text
//! Endpoint ─┐                                        ┌─► IdentityKeyring ──► RemoteSigner ──► relying party
//! Endpoint ─┼─► Incoming ──► listen ──► ProxyKeyring ─┤
//! Endpoint ─┘   (mpsc)     (task per                  └─► BackendConnector ──► ssh-agent
//!                            connection)
//! ```
//!
//! [`IdentityKeyring`] owns the lock state.  [`ProxyKeyring`] merges it with
//! a conventional agent.  [`listen::serve`] drives either one on any number
//! of sockets, bound here or passed in by systemd ([`activation`]).

pub mod activation;
pub mod backend;
pub mod error;
pub mod keyring;
pub mod listen;
pub mod proxy;
pub mod rp;
pub mod signer;

#[cfg(test)]
mod testutil;

pub use backend::{BackendConnector, UnixSocketBackend};
pub use error::{KeyringError, ListenError, ProxyError, RemoteError};
pub use keyring::IdentityKeyring;
pub use listen::{Endpoint, SessionFactory, serve};
pub use proxy::{AgentSigner, ProxyKeyring};
pub use rp::RpClient;
pub use signer::RemoteSigner;
