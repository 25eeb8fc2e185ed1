//! Webhook signature verification using HMAC-SHA256.
//!
//! GitHub signs the raw request body with the shared webhook secret and sends
//! the result in `X-Hub-Signature-256` as `sha256=<hex>`. Verification runs
//! on the unparsed bytes, before anything else looks at the payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

/// Parse a `sha256=<hex>` header value into raw signature bytes.
///
/// Returns `None` for anything else (missing prefix, other algorithm, bad hex).
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_sig = header.strip_prefix("sha256=")?;
    hex::decode(hex_sig).ok()
}

/// HMAC-SHA256 of `payload` under `secret`.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Check `signature_header` against the body and secret.
///
/// Absent, malformed and mismatched signatures all yield `false`. The
/// comparison is constant-time.
pub fn verify(payload: &[u8], signature_header: Option<&str>, secret: &[u8]) -> bool {
    let Some(expected) = signature_header.and_then(parse_signature_header) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_signature_header() {
        assert_eq!(
            parse_signature_header("sha256=1234abcd"),
            Some(vec![0x12, 0x34, 0xab, 0xcd])
        );
        assert_eq!(
            parse_signature_header("sha256=ABCD"),
            Some(vec![0xab, 0xcd])
        );
        assert_eq!(parse_signature_header("1234abcd"), None);
        assert_eq!(parse_signature_header("sha1=1234abcd"), None);
        assert_eq!(parse_signature_header("sha256=xyz"), None);
        assert_eq!(parse_signature_header("sha256=abc"), None);
        assert_eq!(parse_signature_header(""), None);
    }

    /// Test vector from GitHub's webhook validation docs.
    #[test]
    fn test_github_documentation_vector() {
        let header =
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17";
        assert!(verify(
            b"Hello, World!",
            Some(header),
            b"It's a Secret to Everybody"
        ));
    }

    #[test]
    fn test_round_trip() {
        let payload = br#"{"action":"opened"}"#;
        let header = format_signature_header(&compute_signature(payload, b"secret"));
        assert!(verify(payload, Some(&header), b"secret"));
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let payload = b"payload";
        let header = format_signature_header(&compute_signature(payload, b"right"));
        assert!(!verify(payload, Some(&header), b"wrong"));
    }

    #[test]
    fn test_rejects_missing_and_malformed() {
        assert!(!verify(b"payload", None, b"secret"));
        assert!(!verify(b"payload", Some(""), b"secret"));
        assert!(!verify(b"payload", Some("sha256="), b"secret"));
        assert!(!verify(b"payload", Some("sha256=zz"), b"secret"));
    }

    #[test]
    fn test_rejects_truncated_signature() {
        let payload = b"payload";
        let sig = compute_signature(payload, b"secret");
        let header = format_signature_header(&sig[..16]);
        assert!(!verify(payload, Some(&header), b"secret"));
    }

    proptest! {
        #[test]
        fn valid_signatures_verify(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            secret in prop::collection::vec(any::<u8>(), 1..64),
        ) {
            let header = format_signature_header(&compute_signature(&payload, &secret));
            prop_assert!(verify(&payload, Some(&header), &secret));
        }

        #[test]
        fn body_bit_flip_fails(
            payload in prop::collection::vec(any::<u8>(), 1..512),
            secret in prop::collection::vec(any::<u8>(), 1..64),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let header = format_signature_header(&compute_signature(&payload, &secret));
            let mut tampered = payload.clone();
            let i = index.index(tampered.len());
            tampered[i] ^= 1 << bit;
            prop_assert!(!verify(&tampered, Some(&header), &secret));
        }

        #[test]
        fn signature_bit_flip_fails(
            payload in prop::collection::vec(any::<u8>(), 0..512),
            secret in prop::collection::vec(any::<u8>(), 1..64),
            index in any::<prop::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut sig = compute_signature(&payload, &secret);
            let i = index.index(sig.len());
            sig[i] ^= 1 << bit;
            let header = format_signature_header(&sig);
            prop_assert!(!verify(&payload, Some(&header), &secret));
        }

        #[test]
        fn parse_never_panics(header in ".*") {
            let _ = parse_signature_header(&header);
        }
    }
}
