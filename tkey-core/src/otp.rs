//! Confirmation codes.
//!
//! HOTP-style dynamic truncation (RFC 4226 §5.3) over `HMAC-SHA1(key, message)`,
//! rendered as exactly six decimal digits.  The agent keys it with the
//! base64 challenge digest and feeds it the relying party's callback URL, so
//! the paired device can derive the same code independently.

use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

const DIGITS_MODULUS: u32 = 1_000_000;

pub fn one_time_password(key: &[u8], message: &[u8]) -> String {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let hash = mac.finalize().into_bytes();

    let offset = usize::from(hash[hash.len() - 1] & 0x0f);
    let word = u32::from_be_bytes([
        hash[offset],
        hash[offset + 1],
        hash[offset + 2],
        hash[offset + 3],
    ]) & 0x7fff_ffff;

    format!("{:06}", word % DIGITS_MODULUS)
}
