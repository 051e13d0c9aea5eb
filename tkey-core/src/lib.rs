//! Core building blocks for the tkey SSH agent.
//!
//! Nothing in this crate touches the network.  It covers:
//!
//! - **`address`**: deterministic subject address derived from a public key
//! - **`otp`**: the 6-digit confirmation code shown to the user
//! - **`token`**: HMAC-signed bearer tokens for relying-party requests
//! - **`identity`**: a configured remote identity (public key + RP credentials)
//! - **`config`**: the JSON configuration file
//! - **`notify`**: the sink the confirmation code is delivered through

pub mod address;
pub mod config;
pub mod error;
pub mod identity;
pub mod notify;
pub mod otp;
pub mod token;

pub use error::{ConfigError, TokenError};
pub use identity::RemoteIdentity;
pub use notify::Notifier;
