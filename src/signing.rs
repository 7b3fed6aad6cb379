use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the hex HMAC-SHA256 signature for a webhook body.
///
/// The source secret is a hex string and is used verbatim as UTF-8 key
/// material; it is not decoded. This matches how sources are provisioned:
/// 32 random bytes are hex-encoded once and the resulting string is the
/// shared key on both sides.
pub fn compute_signature(secret_hex: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_hex.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a supplied hex signature against the request body.
///
/// The comparison is constant-time over equal-length strings; a length
/// mismatch is rejected up front without a byte-wise early exit. Blank
/// signatures are a different error kind and are screened out by the
/// ingest pipeline before this is called.
pub fn verify_signature(secret_hex: &str, body: &[u8], supplied_sig: &str) -> bool {
    let expected = compute_signature(secret_hex, body);
    constant_time_eq(expected.as_bytes(), supplied_sig.as_bytes())
}

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

    const SECRET: &str = "9f2d1c0b8a7e6d5c4b3a29181706f5e4d3c2b1a09f8e7d6c5b4a392817065f4e";

    #[test]
    fn valid_signature_verifies() {
        let body = br#"{"action":"opened"}"#;
        let sig = compute_signature(SECRET, body);
        assert!(verify_signature(SECRET, body, &sig));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let sig = compute_signature(SECRET, br#"{"action":"opened"}"#);
        assert!(!verify_signature(SECRET, br#"{"action":"closed"}"#, &sig));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = br#"{"action":"opened"}"#;
        let sig = compute_signature(SECRET, body);
        assert!(!verify_signature("deadbeef", body, &sig));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let body = b"payload";
        let sig = compute_signature(SECRET, body);
        assert!(!verify_signature(SECRET, body, &sig[..10]));
        assert!(!verify_signature(SECRET, body, &format!("{sig}00")));
    }

    #[test]
    fn secret_is_keyed_as_text_not_decoded_hex() {
        // Signing with the decoded bytes must NOT produce the same mac.
        let body = b"payload";
        let text_keyed = compute_signature(SECRET, body);

        let mut mac = HmacSha256::new_from_slice(&hex::decode(SECRET).unwrap()).unwrap();
        mac.update(body);
        let byte_keyed = hex::encode(mac.finalize().into_bytes());

        assert_ne!(text_keyed, byte_keyed);
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"", b""));
    }
}
