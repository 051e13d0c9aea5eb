//! Bearer tokens for relying-party requests.
//!
//! Compact HS256 JWS: `b64url(header) "." b64url(claims) "." b64url(mac)`,
//! where `mac = HMAC-SHA256(client_secret, b64url(header) "." b64url(claims))`.
//! Each token names one exact request URL as its audience and expires
//! [`TOKEN_LIFETIME`] after issue.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

/// How long a token stays valid.  Bounds a single request, not a whole login.
pub const TOKEN_LIFETIME: Duration = Duration::from_secs(180);

// Field order is the serialized order.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub alg: String,
    pub iss: String,
    pub typ: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub aud: String,
    pub exp: i64,
    pub sub: String,
}

/// Build a token for `url`, issued now.
pub fn bearer_token(url: &str, client_id: &str, secret: &[u8]) -> Result<String, TokenError> {
    bearer_token_at(url, client_id, secret, SystemTime::now())
}

/// Build a token for `url` as if issued at `now`.
pub fn bearer_token_at(
    url: &str,
    client_id: &str,
    secret: &[u8],
    now: SystemTime,
) -> Result<String, TokenError> {
    let issued = now.duration_since(UNIX_EPOCH).map_err(|_| TokenError::Clock)?;

    let header = Header {
        alg: "HS256".to_string(),
        iss: client_id.to_string(),
        typ: "JWT".to_string(),
    };
    let claims = Claims {
        aud: url.to_string(),
        exp: (issued + TOKEN_LIFETIME).as_secs() as i64,
        sub: client_id.to_string(),
    };

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
    );
    let mac = mac_segment(&signing_input, secret);

    Ok(format!("{signing_input}.{mac}"))
}

/// The third token segment for a given `header.claims` signing input.
pub fn mac_segment(signing_input: &str, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(signing_input.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://rp.example/sshlogin?nonce=abc%3D&subjectaddress=0x01";

    fn segments(token: &str) -> Vec<&str> {
        token.split('.').collect()
    }

    fn decode<T: serde::de::DeserializeOwned>(segment: &str) -> T {
        serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
    }

    #[test]
    fn has_three_unpadded_segments() {
        let token = bearer_token(URL, "client-1", b"secret").unwrap();
        let parts = segments(&token);
        assert_eq!(parts.len(), 3);
        assert!(parts.iter().all(|p| !p.is_empty() && !p.contains('=')));
    }

    #[test]
    fn header_and_claims_content() {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let token = bearer_token_at(URL, "client-1", b"secret", now).unwrap();
        let parts = segments(&token);

        let header: Header = decode(parts[0]);
        assert_eq!(header.alg, "HS256");
        assert_eq!(header.typ, "JWT");
        assert_eq!(header.iss, "client-1");

        let claims: Claims = decode(parts[1]);
        assert_eq!(claims.aud, URL);
        assert_eq!(claims.sub, "client-1");
        assert_eq!(claims.exp, 1_700_000_180);
    }

    #[test]
    fn remac_reproduces_signature() {
        let token = bearer_token(URL, "client-1", b"s3cret").unwrap();
        let (signing_input, mac) = token.rsplit_once('.').unwrap();
        assert_eq!(mac_segment(signing_input, b"s3cret"), mac);
    }

    #[test]
    fn different_secret_gives_different_mac() {
        let token = bearer_token(URL, "client-1", b"s3cret").unwrap();
        let (signing_input, mac) = token.rsplit_once('.').unwrap();
        assert_ne!(mac_segment(signing_input, b"other"), mac);
    }

    #[test]
    fn mac_verifies_with_hmac_crate() {
        let token = bearer_token(URL, "client-1", b"s3cret").unwrap();
        let (signing_input, mac) = token.rsplit_once('.').unwrap();

        let mut verifier = HmacSha256::new_from_slice(b"s3cret").unwrap();
        verifier.update(signing_input.as_bytes());
        verifier
            .verify_slice(&URL_SAFE_NO_PAD.decode(mac).unwrap())
            .unwrap();
    }

    #[test]
    fn deterministic_for_fixed_clock() {
        let now = UNIX_EPOCH + Duration::from_secs(42);
        let a = bearer_token_at(URL, "c", b"k", now).unwrap();
        let b = bearer_token_at(URL, "c", b"k", now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn clock_before_epoch_is_an_error() {
        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert!(matches!(
            bearer_token_at(URL, "c", b"k", before),
            Err(TokenError::Clock)
        ));
    }
}
