use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SECRET_BYTES: usize = 32;

/// Domain-separation label for the bearer derivation. Both peers derive the
/// same token from the shared secret independently.
const TOKEN_LABEL: &[u8] = b"p2p-auth";

/// Generate a fresh 32-byte shared secret.
pub fn generate_secret() -> [u8; SECRET_BYTES] {
    let mut secret = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut secret);
    secret
}

/// Derive the bearer token: lowercase hex of `HMAC-SHA256(secret, "p2p-auth")`.
pub fn derive_token(secret: &[u8; SECRET_BYTES]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(TOKEN_LABEL);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a presented bearer against the secret.
///
/// Never fails: any malformed input is simply not the token. Comparison is
/// constant-time after a length short-circuit.
pub fn verify_token(presented: &str, secret: &[u8; SECRET_BYTES]) -> bool {
    let expected = derive_token(secret);
    constant_time_eq(presented.as_bytes(), expected.as_bytes())
}

/// Encode a secret for on-wire transport (standard base64, with padding).
pub fn encode_secret(secret: &[u8; SECRET_BYTES]) -> String {
    STANDARD.encode(secret)
}

/// Decode a transported secret. Returns `None` for anything that is not
/// exactly 32 base64-encoded bytes.
pub fn decode_secret(encoded: &str) -> Option<[u8; SECRET_BYTES]> {
    let bytes = STANDARD.decode(encoded).ok()?;
    let mut secret = [0u8; SECRET_BYTES];
    if bytes.len() != SECRET_BYTES {
        return None;
    }
    secret.copy_from_slice(&bytes);
    Some(secret)
}

/// Byte comparison whose timing does not depend on the position of the first
/// mismatch. Length mismatch short-circuits.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_token_is_deterministic_hex() {
        let secret = [7u8; SECRET_BYTES];
        let a = derive_token(&secret);
        let b = derive_token(&secret);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn verify_accepts_own_token_and_rejects_others() {
        let secret = generate_secret();
        let other = generate_secret();
        assert!(verify_token(&derive_token(&secret), &secret));
        assert!(!verify_token(&derive_token(&other), &secret));
    }

    #[test]
    fn verify_rejects_malformed_input() {
        let secret = generate_secret();
        assert!(!verify_token("", &secret));
        assert!(!verify_token("not-hex-at-all", &secret));
        assert!(!verify_token(&"f".repeat(65), &secret));
    }

    #[test]
    fn secret_transport_round_trips() {
        let secret = generate_secret();
        let encoded = encode_secret(&secret);
        assert_eq!(decode_secret(&encoded), Some(secret));
        assert_eq!(decode_secret("###"), None);
        assert_eq!(decode_secret(&STANDARD.encode([1u8; 16])), None);
    }

    #[test]
    fn constant_time_eq_ignores_mismatch_position() {
        // Behavioural check only: equal-length inputs differing early vs late
        // both compare false through the same full-scan path.
        let base = [0u8; 64];
        let mut early = base;
        early[0] = 1;
        let mut late = base;
        late[63] = 1;
        assert!(!constant_time_eq(&early, &base));
        assert!(!constant_time_eq(&late, &base));
        assert!(constant_time_eq(&base, &base));
    }
}
