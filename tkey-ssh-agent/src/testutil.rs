//! Fixtures shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use p256::ecdsa::SigningKey;
use p256::ecdsa::signature::Signer as _;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tkey_core::{Notifier, RemoteIdentity};

use crate::rp::RpClient;
use crate::signer::RemoteSigner;

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<String>>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, otp: &str) {
        self.0.lock().unwrap().push(otp.to_string());
    }
}

impl RecordingNotifier {
    pub fn codes(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Deterministic key; distinct seeds give distinct keys.
pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_slice(&[seed; 32]).unwrap()
}

pub fn public_key_hex(seed: u8) -> String {
    let point = signing_key(seed).verifying_key().to_encoded_point(false);
    hex::encode(point.as_bytes())
}

pub fn identity(seed: u8, rp_url: &str) -> RemoteIdentity {
    RemoteIdentity::new(&public_key_hex(seed), rp_url, "client-1", "secret").unwrap()
}

pub fn signer(seed: u8, rp_url: &str) -> (RemoteSigner, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    let signer = RemoteSigner::new(
        identity(seed, rp_url),
        RpClient::new().unwrap(),
        notifier.clone(),
    );
    (signer, notifier)
}

/// Base64 DER signature over `data`, as a relying party would return it.
pub fn der_signature(seed: u8, data: &[u8]) -> String {
    let sig: p256::ecdsa::Signature = signing_key(seed).sign(data);
    B64.encode(sig.to_der().as_bytes())
}
