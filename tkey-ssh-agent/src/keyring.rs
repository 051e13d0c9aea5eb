//! The keyring of configured remote identities.

use std::sync::{Arc, Mutex, MutexGuard};

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Identity, RemoveIdentity, SignRequest,
};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use subtle::ConstantTimeEq as _;
use tkey_core::{Notifier, RemoteIdentity};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::error::KeyringError;
use crate::rp::RpClient;
use crate::signer::RemoteSigner;

/// Locked iff a passphrase is held.
#[derive(Default)]
struct LockState {
    passphrase: Option<Zeroizing<Vec<u8>>>,
}

struct Shared {
    signers: Vec<Arc<RemoteSigner>>,
    state: Mutex<LockState>,
}

/// Remote identities in configuration order, behind one lock gate.
///
/// Clones share the identity list and the lock state; each clone carries
/// its own cancellation token, so a clone per client connection lets a
/// dropped connection abandon its pending confirmations.
#[derive(Clone)]
pub struct IdentityKeyring {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IdentityKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyring")
            .field("identities", &self.shared.signers.len())
            .finish_non_exhaustive()
    }
}

impl IdentityKeyring {
    pub fn new(signers: Vec<RemoteSigner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                signers: signers.into_iter().map(Arc::new).collect(),
                state: Mutex::new(LockState::default()),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// One [`RemoteSigner`] per identity, all sharing `rp` and `notifier`.
    pub fn from_identities(
        identities: Vec<RemoteIdentity>,
        rp: RpClient,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self::new(
            identities
                .into_iter()
                .map(|id| RemoteSigner::new(id, rp.clone(), notifier.clone()))
                .collect(),
        )
    }

    /// A handle on the same keyring whose signing waits end when `cancel` fires.
    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            cancel,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, LockState>, KeyringError> {
        self.shared.state.lock().map_err(|_| KeyringError::Poisoned)
    }

    pub fn is_locked(&self) -> Result<bool, KeyringError> {
        Ok(self.state()?.passphrase.is_some())
    }

    /// Empty while locked.
    pub fn list(&self) -> Result<Vec<Identity>, KeyringError> {
        if self.is_locked()? {
            debug!("request_identities while locked");
            return Ok(Vec::new());
        }
        Ok(self
            .shared
            .signers
            .iter()
            .map(|s| Identity {
                pubkey: s.public_key().clone(),
                comment: s.identity().address().to_string(),
            })
            .collect())
    }

    pub fn signers(&self) -> Result<Vec<Arc<RemoteSigner>>, KeyringError> {
        if self.is_locked()? {
            return Err(KeyringError::Locked);
        }
        Ok(self.shared.signers.clone())
    }

    /// Sign with the identity whose public key is `key`.
    ///
    /// The lock check and the lookup happen under the state lock; the lock
    /// is released before the remote round trip starts.
    pub async fn sign(&self, key: &KeyData, data: &[u8]) -> Result<Signature, KeyringError> {
        let signer = {
            let state = self.state()?;
            if state.passphrase.is_some() {
                return Err(KeyringError::Locked);
            }
            self.shared
                .signers
                .iter()
                .find(|s| s.public_key() == key)
                .cloned()
                .ok_or(KeyringError::SignerNotFound)?
        };

        debug!(
            address = signer.identity().address(),
            data_len = data.len(),
            "sign"
        );
        Ok(signer.sign(data, &self.cancel).await?)
    }

    pub fn lock(&self, passphrase: &[u8]) -> Result<(), KeyringError> {
        let mut state = self.state()?;
        if state.passphrase.is_some() {
            return Err(KeyringError::AlreadyLocked);
        }
        state.passphrase = Some(Zeroizing::new(passphrase.to_vec()));
        info!("agent locked");
        Ok(())
    }

    pub fn unlock(&self, passphrase: &[u8]) -> Result<(), KeyringError> {
        let mut state = self.state()?;
        let Some(stored) = state.passphrase.as_ref() else {
            return Err(KeyringError::NotLocked);
        };
        // `ct_eq` on slices of different lengths is already false; the
        // length itself is not secret.
        if !bool::from(stored.as_slice().ct_eq(passphrase)) {
            warn!("unlock attempt with incorrect passphrase");
            return Err(KeyringError::WrongPassphrase);
        }
        state.passphrase = None;
        info!("agent unlocked");
        Ok(())
    }
}

#[ssh_agent_lib::async_trait]
impl Session for IdentityKeyring {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        Ok(self.list()?)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        Ok(IdentityKeyring::sign(self, &request.pubkey, &request.data).await?)
    }

    async fn add_identity(&mut self, _identity: AddIdentity) -> Result<(), AgentError> {
        Err(KeyringError::NotSupported.into())
    }

    async fn add_identity_constrained(
        &mut self,
        _identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        Err(KeyringError::NotSupported.into())
    }

    async fn remove_identity(&mut self, _identity: RemoveIdentity) -> Result<(), AgentError> {
        Err(KeyringError::NotSupported.into())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        Err(KeyringError::NotSupported.into())
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        Ok(IdentityKeyring::lock(self, key.as_bytes())?)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        Ok(IdentityKeyring::unlock(self, key.as_bytes())?)
    }
}
