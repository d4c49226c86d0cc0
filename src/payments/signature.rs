use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac_over(secret: &[u8], parts: &[&[u8]]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    for part in parts {
        mac.update(part);
    }
    mac
}

/// Lowercase hex HMAC-SHA256 of the concatenated parts.
#[cfg(test)]
pub fn hmac_sha256_hex(secret: &[u8], parts: &[&[u8]]) -> String {
    hex::encode(mac_over(secret, parts).finalize().into_bytes())
}

/// Constant-time check of a hex signature against the concatenated parts.
pub fn verify_hex(secret: &[u8], parts: &[&[u8]], candidate: &str) -> bool {
    match hex::decode(candidate.trim()) {
        Some(bytes) => mac_over(secret, parts).verify_slice(&bytes).is_ok(),
        None => false,
    }
}

mod hex {
    #[cfg(test)]
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn decode(input: &str) -> Option<Vec<u8>> {
        if input.len() % 2 != 0 {
            return None;
        }
        (0..input.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(input.get(i..i + 2)?, 16).ok())
            .collect()
    }
}
