//! Configured remote identities.
//!
//! A [`RemoteIdentity`] is a public key whose private half lives with a
//! relying party, together with the credentials used to authenticate to
//! that relying party.  No private key material is ever held locally.

use ssh_key::public::{EcdsaPublicKey, KeyData};
use zeroize::Zeroizing;

use crate::address;
use crate::config::IdentityRecord;
use crate::error::ConfigError;

pub struct RemoteIdentity {
    public_key_hex: String,
    public_key: KeyData,
    rp_url: String,
    client_id: String,
    client_secret: Zeroizing<String>,
    address: String,
}

impl RemoteIdentity {
    /// Build an identity from its hex-encoded SEC1 P-256 public key and the
    /// relying-party credentials.
    ///
    /// Fails with [`ConfigError::InvalidKey`] if the key is not valid hex or
    /// not a point on the curve.
    pub fn new(
        public_key_hex: &str,
        rp_url: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidKey {
            key: public_key_hex.to_string(),
            reason,
        };

        let point = hex::decode(public_key_hex).map_err(|e| invalid(e.to_string()))?;
        p256::PublicKey::from_sec1_bytes(&point)
            .map_err(|_| invalid("not a P-256 curve point".to_string()))?;
        let ecdsa = EcdsaPublicKey::from_sec1_bytes(&point).map_err(|e| invalid(e.to_string()))?;
        let address = address::address_from_sec1(&point);

        Ok(Self {
            public_key_hex: public_key_hex.to_string(),
            public_key: KeyData::Ecdsa(ecdsa),
            rp_url: rp_url.trim_end_matches('/').to_string(),
            client_id: client_id.to_string(),
            client_secret: Zeroizing::new(client_secret.to_string()),
            address,
        })
    }

    pub fn from_record(record: &IdentityRecord) -> Result<Self, ConfigError> {
        Self::new(
            &record.public_key,
            &record.rp_url,
            &record.client_id,
            &record.client_secret,
        )
    }

    /// Hex-encoded SEC1 public key, exactly as it appears in the config file.
    pub fn public_key_hex(&self) -> &str {
        &self.public_key_hex
    }

    /// SSH wire-format public key (`ecdsa-sha2-nistp256`).
    pub fn public_key(&self) -> &KeyData {
        &self.public_key
    }

    /// Relying-party base URL, without a trailing slash.
    pub fn rp_url(&self) -> &str {
        &self.rp_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &[u8] {
        self.client_secret.as_bytes()
    }

    /// Subject address; also used as the key comment.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Debug for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteIdentity")
            .field("address", &self.address)
            .field("rp_url", &self.rp_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .finish_non_exhaustive()
    }
}
