use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over `payload`.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify an HMAC-SHA256 signature using constant-time comparison
pub fn verify_payload(
    secret: &[u8],
    payload: &[u8],
    signature: &[u8],
) -> Result<bool, anyhow::Error> {
    let expected = sign_payload(secret, payload)?;

    if expected.len() != signature.len() {
        return Ok(false);
    }

    Ok(expected.as_slice().ct_eq(signature).into())
}
