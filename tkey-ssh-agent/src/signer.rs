//! Remote signing for one identity.
//!
//! A signature is produced in two phases:
//!
//! 1. `GET /sshlogin` with the base64 SHA-256 of the data.  The relying
//!    party answers with a `callbackUrl` and a `loginRequestId`.
//! 2. The confirmation code (derived from the digest and `callbackUrl`) is
//!    shown to the user, then `GET /sshloginPart2` long-polls until the user
//!    confirms on their device.  The reply carries a DER `{r, s}` signature,
//!    re-encoded here as an SSH signature blob.
//!
//! The relying party answers a poll that outlived its window with `408`;
//! the poll is then repeated, at most [`MAX_CONFIRM_ATTEMPTS`] times.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use sha2::{Digest, Sha256};
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, Signature};
use tkey_core::{Notifier, RemoteIdentity, otp};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::RemoteError;
use crate::rp::RpClient;

/// Upper bound on phase-2 polls for one signature.
pub const MAX_CONFIRM_ATTEMPTS: u32 = 20;

/// One in-flight signing attempt.  Never outlives [`RemoteSigner::sign`].
#[derive(Debug)]
struct PendingLogin {
    nonce: String,
    callback_url: String,
    login_request_id: String,
}

pub struct RemoteSigner {
    identity: RemoteIdentity,
    rp: RpClient,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for RemoteSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSigner")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl RemoteSigner {
    pub fn new(identity: RemoteIdentity, rp: RpClient, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            identity,
            rp,
            notifier,
        }
    }

    pub fn identity(&self) -> &RemoteIdentity {
        &self.identity
    }

    pub fn public_key(&self) -> &KeyData {
        self.identity.public_key()
    }

    /// Obtain a signature over `data` from the relying party.
    ///
    /// Notifies the user exactly once, after phase 1 succeeds.  May wait as
    /// long as the relying party lets the user take to confirm; `cancel`
    /// aborts the wait.
    pub async fn sign(
        &self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Signature, RemoteError> {
        let nonce = B64.encode(Sha256::digest(data));
        let address = self.identity.address();

        debug!(address, data_len = data.len(), "starting remote login");
        let started = cancellable(cancel, self.rp.start_login(&self.identity, &nonce)).await?;

        let pending = PendingLogin {
            nonce,
            callback_url: started
                .callback_url
                .ok_or(RemoteError::MissingField("callbackUrl"))?,
            login_request_id: started
                .login_request_id
                .ok_or(RemoteError::MissingField("loginRequestId"))?,
        };

        let code =
            otp::one_time_password(pending.nonce.as_bytes(), pending.callback_url.as_bytes());
        self.notifier.notify(&code).await;
        info!(
            address,
            login_request_id = %pending.login_request_id,
            "waiting for confirmation on paired device"
        );

        let encoded = self.wait_for_confirmation(&pending, cancel).await?;
        let signature = decode_signature(self.public_key().algorithm(), &encoded)?;
        debug!(address, "remote signature received");
        Ok(signature)
    }

    async fn wait_for_confirmation(
        &self,
        pending: &PendingLogin,
        cancel: &CancellationToken,
    ) -> Result<String, RemoteError> {
        for attempt in 1..=MAX_CONFIRM_ATTEMPTS {
            let poll = self
                .rp
                .poll_confirmation(&self.identity, &pending.login_request_id);
            match cancellable(cancel, poll).await {
                Err(e) if e.is_request_timeout() => {
                    debug!(
                        attempt,
                        login_request_id = %pending.login_request_id,
                        "confirmation poll timed out, retrying"
                    );
                }
                Err(e) => return Err(e),
                Ok(confirmed) => {
                    return confirmed
                        .signature
                        .ok_or(RemoteError::MissingField("signature"));
                }
            }
        }
        Err(RemoteError::ConfirmationTimeout {
            attempts: MAX_CONFIRM_ATTEMPTS,
        })
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RemoteError::Cancelled),
        result = request => result,
    }
}

/// Turn a base64 DER `SEQUENCE { INTEGER r, INTEGER s }` into an SSH
/// signature (`mpint(r) || mpint(s)`) for `algorithm`.
pub fn decode_signature(algorithm: Algorithm, encoded: &str) -> Result<Signature, RemoteError> {
    let der = B64
        .decode(encoded)
        .map_err(|e| RemoteError::Signature(format!("base64: {e}")))?;
    let parsed = p256::ecdsa::Signature::from_der(&der)
        .map_err(|e| RemoteError::Signature(format!("DER: {e}")))?;

    let (r, s) = parsed.split_bytes();
    let mut blob = Vec::with_capacity(2 * (4 + 33));
    put_mpint(&mut blob, &r);
    put_mpint(&mut blob, &s);

    Signature::new(algorithm, blob).map_err(|e| RemoteError::Signature(e.to_string()))
}

/// SSH `mpint` encoding of a non-negative big-endian integer.
fn put_mpint(out: &mut Vec<u8>, magnitude: &[u8]) {
    let start = magnitude.iter().position(|&b| b != 0).unwrap_or(magnitude.len());
    let digits = &magnitude[start..];
    let pad = digits.first().is_some_and(|&b| b & 0x80 != 0);

    let len = digits.len() + usize::from(pad);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    if pad {
        out.push(0);
    }
    out.extend_from_slice(digits);
}
