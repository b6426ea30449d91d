//! Integrity primitives: metadata HMAC tags and value checksums.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use sentinel_common::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Length of the trailing HMAC-SHA256 tag in bytes.
pub const TAG_LENGTH: usize = 32;

/// Append an HMAC-SHA256 tag over `payload` keyed with `secret`.
pub fn append_tag(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);

    let mut result = Vec::with_capacity(payload.len() + TAG_LENGTH);
    result.extend_from_slice(payload);
    result.extend_from_slice(&mac.finalize().into_bytes());
    result
}

/// Verify the trailing tag and return the payload slice.
///
/// # Errors
/// - Returns error if `data` is shorter than a tag or the tag does not verify
pub fn split_verified<'a>(secret: &[u8], data: &'a [u8]) -> Result<&'a [u8]> {
    if data.len() < TAG_LENGTH {
        return Err(Error::Crypto("data shorter than integrity tag".to_string()));
    }

    let (payload, tag) = data.split_at(data.len() - TAG_LENGTH);

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    mac.verify_slice(tag)
        .map_err(|_| Error::Crypto("integrity tag mismatch".to_string()))?;

    Ok(payload)
}

/// Hex-encoded SHA-256 of `data`.
pub fn hex_checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Raw SHA-256 of `data`.
pub fn digest(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
