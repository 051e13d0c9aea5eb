//! Composition of the identity keyring with a second agent.
//!
//! The local keyring always answers first.  Only a
//! [`KeyringError::SignerNotFound`] sends a signature request on to the
//! backend; every other local failure is final.  Mutations go to the backend
//! alone, lock and unlock go to both (local first), and listings are the
//! local identities followed by the backend's.
//!
//! Lock and unlock are not transactional across the two halves: when the
//! backend refuses, the local keyring keeps its new state.

use std::sync::Arc;

use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{
    AddIdentity, AddIdentityConstrained, Identity, RemoveIdentity, SignRequest,
};
use ssh_key::Signature;
use ssh_key::public::KeyData;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::backend::BackendConnector;
use crate::error::{KeyringError, ProxyError};
use crate::keyring::IdentityKeyring;
use crate::signer::RemoteSigner;

#[derive(Clone)]
pub struct ProxyKeyring {
    primary: IdentityKeyring,
    backend: Arc<dyn BackendConnector>,
}

impl std::fmt::Debug for ProxyKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyKeyring")
            .field("primary", &self.primary)
            .field("backend", &self.backend.describe())
            .finish()
    }
}

/// Something that can produce a signature for one key.
pub enum AgentSigner {
    /// A configured identity, signed by its relying party.
    Remote(Arc<RemoteSigner>),
    /// A key held by the backend agent.
    Forwarded {
        identity: Identity,
        backend: Arc<dyn BackendConnector>,
    },
}

impl std::fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(signer) => f.debug_tuple("Remote").field(signer).finish(),
            Self::Forwarded { identity, backend } => f
                .debug_struct("Forwarded")
                .field("comment", &identity.comment)
                .field("backend", &backend.describe())
                .finish(),
        }
    }
}

impl AgentSigner {
    pub fn public_key(&self) -> &KeyData {
        match self {
            Self::Remote(signer) => signer.public_key(),
            Self::Forwarded { identity, .. } => &identity.pubkey,
        }
    }

    pub fn comment(&self) -> &str {
        match self {
            Self::Remote(signer) => signer.identity().address(),
            Self::Forwarded { identity, .. } => &identity.comment,
        }
    }

    pub async fn sign(
        &self,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<Signature, ProxyError> {
        match self {
            Self::Remote(signer) => signer
                .sign(data, cancel)
                .await
                .map_err(|e| KeyringError::from(e).into()),
            Self::Forwarded { identity, backend } => {
                let mut session = backend.connect().await?;
                let request = SignRequest {
                    pubkey: identity.pubkey.clone(),
                    data: data.to_vec(),
                    flags: 0,
                };
                Ok(session.sign(request).await?)
            }
        }
    }
}

impl ProxyKeyring {
    pub fn new(primary: IdentityKeyring, backend: Arc<dyn BackendConnector>) -> Self {
        Self { primary, backend }
    }

    pub fn primary(&self) -> &IdentityKeyring {
        &self.primary
    }

    pub fn with_cancellation(&self, cancel: CancellationToken) -> Self {
        Self {
            primary: self.primary.with_cancellation(cancel),
            backend: Arc::clone(&self.backend),
        }
    }

    async fn backend(&self) -> Result<Box<dyn Session>, ProxyError> {
        Ok(self.backend.connect().await?)
    }

    pub async fn list(&self) -> Result<Vec<Identity>, ProxyError> {
        let mut identities = self.primary.list()?;
        let forwarded = self.backend().await?.request_identities().await?;
        debug!(
            local = identities.len(),
            backend = forwarded.len(),
            "request_identities"
        );
        identities.extend(forwarded);
        Ok(identities)
    }

    pub async fn sign(&self, request: SignRequest) -> Result<Signature, ProxyError> {
        let local = self.primary.sign(&request.pubkey, &request.data).await;
        match local {
            Err(KeyringError::SignerNotFound) => {
                debug!(backend = %self.backend.describe(), "key not local, forwarding sign");
                Ok(self.backend().await?.sign(request).await?)
            }
            result => Ok(result?),
        }
    }

    pub async fn add(&self, identity: AddIdentity) -> Result<(), ProxyError> {
        Ok(self.backend().await?.add_identity(identity).await?)
    }

    pub async fn add_constrained(
        &self,
        identity: AddIdentityConstrained,
    ) -> Result<(), ProxyError> {
        Ok(self.backend().await?.add_identity_constrained(identity).await?)
    }

    pub async fn remove(&self, identity: RemoveIdentity) -> Result<(), ProxyError> {
        Ok(self.backend().await?.remove_identity(identity).await?)
    }

    pub async fn remove_all(&self) -> Result<(), ProxyError> {
        Ok(self.backend().await?.remove_all_identities().await?)
    }

    pub async fn lock(&self, passphrase: &str) -> Result<(), ProxyError> {
        self.primary.lock(passphrase.as_bytes())?;
        let forwarded: Result<(), ProxyError> =
            async { Ok(self.backend().await?.lock(passphrase.to_string()).await?) }.await;
        if let Err(e) = &forwarded {
            warn!(error = %e, "backend refused lock, local keyring stays locked");
        }
        forwarded
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<(), ProxyError> {
        self.primary.unlock(passphrase.as_bytes())?;
        let forwarded: Result<(), ProxyError> =
            async { Ok(self.backend().await?.unlock(passphrase.to_string()).await?) }.await;
        if let Err(e) = &forwarded {
            warn!(error = %e, "backend refused unlock, local keyring stays unlocked");
        }
        forwarded
    }

    pub async fn signers(&self) -> Result<Vec<AgentSigner>, ProxyError> {
        let mut signers: Vec<AgentSigner> = self
            .primary
            .signers()?
            .into_iter()
            .map(AgentSigner::Remote)
            .collect();
        let forwarded = self.backend().await?.request_identities().await?;
        signers.extend(forwarded.into_iter().map(|identity| AgentSigner::Forwarded {
            identity,
            backend: Arc::clone(&self.backend),
        }));
        Ok(signers)
    }
}

#[ssh_agent_lib::async_trait]
impl Session for ProxyKeyring {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        Ok(self.list().await?)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        Ok(ProxyKeyring::sign(self, request).await?)
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        Ok(self.add(identity).await?)
    }

    async fn add_identity_constrained(
        &mut self,
        identity: AddIdentityConstrained,
    ) -> Result<(), AgentError> {
        Ok(self.add_constrained(identity).await?)
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        Ok(self.remove(identity).await?)
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        Ok(self.remove_all().await?)
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        Ok(ProxyKeyring::lock(self, &key).await?)
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        Ok(ProxyKeyring::unlock(self, &key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use ssh_key::{Algorithm, EcdsaCurve};
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::error::RemoteError;
    use crate::rp::LOGIN_PATH;
    use crate::signer::decode_signature;
    use crate::testutil;

    const OFFLINE: &str = "http://127.0.0.1:9";

    /// A conventional agent holding keys in memory.
    #[derive(Clone, Default)]
    struct MemoryAgent {
        keys: Arc<Mutex<Vec<(u8, Identity)>>>,
        passphrase: Arc<Mutex<Option<String>>>,
    }

    impl MemoryAgent {
        fn with_keys(seeds: &[u8]) -> Self {
            let agent = Self::default();
            agent.keys.lock().unwrap().extend(seeds.iter().map(|&seed| {
                (
                    seed,
                    Identity {
                        pubkey: key(seed),
                        comment: format!("backend-{seed}"),
                    },
                )
            }));
            agent
        }

        fn key_count(&self) -> usize {
            self.keys.lock().unwrap().len()
        }

        fn is_locked(&self) -> bool {
            self.passphrase.lock().unwrap().is_some()
        }
    }

    #[async_trait]
    impl Session for MemoryAgent {
        async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
            if self.is_locked() {
                return Ok(Vec::new());
            }
            Ok(self.keys.lock().unwrap().iter().map(|(_, id)| id.clone()).collect())
        }

        async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
            let seed = self
                .keys
                .lock()
                .unwrap()
                .iter()
                .find(|(_, id)| id.pubkey == request.pubkey)
                .map(|(seed, _)| *seed)
                .ok_or(AgentError::Failure)?;
            let der = testutil::der_signature(seed, &request.data);
            decode_signature(nistp256(), &der).map_err(AgentError::other)
        }

        async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
            self.keys.lock().unwrap().retain(|(_, id)| id.pubkey != identity.pubkey);
            Ok(())
        }

        async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
            self.keys.lock().unwrap().clear();
            Ok(())
        }

        async fn lock(&mut self, key: String) -> Result<(), AgentError> {
            let mut passphrase = self.passphrase.lock().unwrap();
            if passphrase.is_some() {
                return Err(AgentError::Failure);
            }
            *passphrase = Some(key);
            Ok(())
        }

        async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
            let mut passphrase = self.passphrase.lock().unwrap();
            if passphrase.as_deref() != Some(key.as_str()) {
                return Err(AgentError::Failure);
            }
            *passphrase = None;
            Ok(())
        }
    }

    struct MemoryConnector {
        agent: MemoryAgent,
        up: bool,
        connects: AtomicUsize,
    }

    #[async_trait]
    impl BackendConnector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn Session>, AgentError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.up {
                return Err(AgentError::IO(io::ErrorKind::ConnectionRefused.into()));
            }
            Ok(Box::new(self.agent.clone()))
        }

        fn describe(&self) -> String {
            "memory".to_string()
        }
    }

    fn nistp256() -> Algorithm {
        Algorithm::Ecdsa {
            curve: EcdsaCurve::NistP256,
        }
    }

    fn key(seed: u8) -> KeyData {
        testutil::identity(seed, OFFLINE).public_key().clone()
    }

    fn sign_request(seed: u8) -> SignRequest {
        SignRequest {
            pubkey: key(seed),
            data: b"data".to_vec(),
            flags: 0,
        }
    }

    fn proxy_with(
        local: &[u8],
        rp_url: &str,
        backend: MemoryAgent,
        up: bool,
    ) -> (ProxyKeyring, Arc<MemoryConnector>) {
        let primary = IdentityKeyring::new(
            local
                .iter()
                .map(|&seed| testutil::signer(seed, rp_url).0)
                .collect(),
        );
        let connector = Arc::new(MemoryConnector {
            agent: backend,
            up,
            connects: AtomicUsize::new(0),
        });
        (ProxyKeyring::new(primary, connector.clone()), connector)
    }

    fn proxy(local: &[u8], backend: &[u8]) -> (ProxyKeyring, Arc<MemoryConnector>) {
        proxy_with(local, OFFLINE, MemoryAgent::with_keys(backend), true)
    }

    async fn listed_keys(proxy: &ProxyKeyring) -> Vec<KeyData> {
        proxy.list().await.unwrap().into_iter().map(|id| id.pubkey).collect()
    }

    #[tokio::test]
    async fn list_is_local_then_backend() {
        let (proxy, _) = proxy(&[1], &[2]);
        let keys = listed_keys(&proxy).await;
        assert_eq!(keys, [key(1), key(2)]);
    }

    #[tokio::test]
    async fn locked_local_keyring_lists_backend_only() {
        let (proxy, _) = proxy(&[1], &[2]);
        proxy.primary().lock(b"pw").unwrap();
        let keys = listed_keys(&proxy).await;
        assert_eq!(keys, [key(2)]);
    }

    #[tokio::test]
    async fn sign_falls_back_for_unknown_local_key() {
        let (proxy, connector) = proxy(&[1], &[2]);
        let sig = proxy.sign(sign_request(2)).await.unwrap();
        assert_eq!(sig.algorithm(), nistp256());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_everywhere_reports_backend_error() {
        let (proxy, _) = proxy(&[1], &[2]);
        assert!(matches!(
            proxy.sign(sign_request(3)).await,
            Err(ProxyError::Backend(AgentError::Failure))
        ));
    }

    #[tokio::test]
    async fn locked_local_keyring_is_authoritative() {
        let (proxy, connector) = proxy(&[1], &[2]);
        proxy.primary().lock(b"pw").unwrap();
        assert!(matches!(
            proxy.sign(sign_request(2)).await,
            Err(ProxyError::Primary(KeyringError::Locked))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remote_failure_is_not_forwarded() {
        let server = MockServer::start().await;
        Mock::given(path(LOGIN_PATH))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        // The backend holds the same key; it must not be asked.
        let (proxy, connector) =
            proxy_with(&[1], &server.uri(), MemoryAgent::with_keys(&[1]), true);

        assert!(matches!(
            proxy.sign(sign_request(1)).await,
            Err(ProxyError::Primary(KeyringError::Remote(RemoteError::Status { .. })))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mutations_go_to_backend_only() {
        let (proxy, connector) = proxy(&[1], &[2, 3]);
        proxy.remove(RemoveIdentity { pubkey: key(2) }).await.unwrap();
        assert_eq!(connector.agent.key_count(), 1);

        proxy.remove_all().await.unwrap();
        assert_eq!(connector.agent.key_count(), 0);

        let keys = listed_keys(&proxy).await;
        assert_eq!(keys, [key(1)]);
    }

    #[tokio::test]
    async fn lock_and_unlock_apply_to_both() {
        let (proxy, connector) = proxy(&[1], &[2]);
        proxy.lock("pw").await.unwrap();
        assert!(proxy.primary().is_locked().unwrap());
        assert!(connector.agent.is_locked());

        proxy.unlock("pw").await.unwrap();
        assert!(!proxy.primary().is_locked().unwrap());
        assert!(!connector.agent.is_locked());
    }

    #[tokio::test]
    async fn local_lock_failure_skips_backend() {
        let (proxy, connector) = proxy(&[1], &[2]);
        proxy.primary().lock(b"pw").unwrap();
        assert!(matches!(
            proxy.lock("other").await,
            Err(ProxyError::Primary(KeyringError::AlreadyLocked))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
        assert!(!connector.agent.is_locked());
    }

    #[tokio::test]
    async fn backend_lock_failure_keeps_local_state() {
        let backend = MemoryAgent::with_keys(&[2]);
        *backend.passphrase.lock().unwrap() = Some("theirs".to_string());
        let (proxy, _) = proxy_with(&[1], OFFLINE, backend, true);

        assert!(matches!(proxy.lock("pw").await, Err(ProxyError::Backend(_))));
        assert!(proxy.primary().is_locked().unwrap());
    }

    #[tokio::test]
    async fn backend_outage_fails_only_the_call() {
        let (proxy, _) = proxy_with(&[1], OFFLINE, MemoryAgent::with_keys(&[2]), false);
        assert!(matches!(
            proxy.list().await,
            Err(ProxyError::Backend(AgentError::IO(_)))
        ));
        assert_eq!(proxy.primary().list().unwrap().len(), 1);
        assert!(matches!(
            proxy.sign(sign_request(1)).await,
            Err(ProxyError::Primary(KeyringError::Remote(RemoteError::Http(_))))
        ));
    }

    #[tokio::test]
    async fn signers_are_local_then_backend() {
        let (proxy, connector) = proxy(&[1], &[2]);
        let signers = proxy.signers().await.unwrap();
        let keys: Vec<&KeyData> = signers.iter().map(AgentSigner::public_key).collect();
        assert_eq!(keys, [&key(1), &key(2)]);
        assert!(matches!(signers[0], AgentSigner::Remote(_)));
        assert_eq!(signers[1].comment(), "backend-2");

        let sig = signers[1].sign(b"data", &CancellationToken::new()).await.unwrap();
        assert_eq!(sig.algorithm(), nistp256());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn signers_fail_while_locked() {
        let (proxy, connector) = proxy(&[1], &[2]);
        proxy.primary().lock(b"pw").unwrap();
        assert!(matches!(
            proxy.signers().await,
            Err(ProxyError::Primary(KeyringError::Locked))
        ));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }
}
