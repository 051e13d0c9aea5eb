//! Subject addresses.
//!
//! An address is `0x` followed by the last 20 bytes of
//! `SHA-256(x || y)`, where `x || y` is the uncompressed P-256 point with its
//! leading `0x04` tag removed.  It is the identity's display name in the key
//! list and the `subjectaddress` sent to the relying party.

use sha2::{Digest, Sha256};

/// Number of leading digest bytes dropped from the address.
const DROPPED_DIGEST_BYTES: usize = 12;

/// Derive the address from the hex form of a SEC1 public key, as stored in
/// the configuration file (`04…`).
///
/// The first two hex characters (the point tag) are skipped before decoding;
/// a key with nothing after its tag is rejected.
pub fn address_from_hex(public_key_hex: &str) -> Result<String, hex::FromHexError> {
    let Some(body) = public_key_hex.get(2..).filter(|body| !body.is_empty()) else {
        return Err(hex::FromHexError::InvalidStringLength);
    };
    let bytes = hex::decode(body)?;
    Ok(address_from_digest_input(&bytes))
}

/// Derive the address from raw SEC1 point bytes (tag byte included).
pub fn address_from_sec1(point: &[u8]) -> String {
    address_from_digest_input(point.get(1..).unwrap_or_default())
}

fn address_from_digest_input(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    format!("0x{}", hex::encode(&digest[DROPPED_DIGEST_BYTES..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "046b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c2964fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5";

    #[test]
    fn address_is_last_twenty_digest_bytes() {
        let point = hex::decode(&KEY_HEX[2..]).unwrap();
        let digest = Sha256::digest(&point);
        let expected = format!("0x{}", &hex::encode(digest)[24..]);

        assert_eq!(address_from_hex(KEY_HEX).unwrap(), expected);
    }

    #[test]
    fn address_shape() {
        let addr = address_from_hex(KEY_HEX).unwrap();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert!(addr[2..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn hex_and_raw_forms_agree() {
        let raw = hex::decode(KEY_HEX).unwrap();
        assert_eq!(address_from_hex(KEY_HEX).unwrap(), address_from_sec1(&raw));
    }

    #[test]
    fn derivation_is_stable() {
        let first = address_from_hex(KEY_HEX).unwrap();
        for _ in 0..8 {
            assert_eq!(address_from_hex(KEY_HEX).unwrap(), first);
        }
    }

    #[test]
    fn uppercase_hex_gives_same_address() {
        let upper = KEY_HEX.to_uppercase();
        assert_eq!(
            address_from_hex(&upper).unwrap(),
            address_from_hex(KEY_HEX).unwrap()
        );
    }

    #[test]
    fn rejects_non_hex() {
        assert!(address_from_hex("04zz").is_err());
        assert!(address_from_hex("04abc").is_err());
    }

    #[test]
    fn rejects_keys_without_a_body() {
        for short in ["", "0", "04", "0\u{e9}"] {
            assert_eq!(
                address_from_hex(short),
                Err(hex::FromHexError::InvalidStringLength),
                "{short:?}"
            );
        }
    }
}
