//! Signed build tokens: compact RS256 JWTs asserting build provenance.
//!
//! Some build systems record a signed token on the image's backend metadata
//! instead of a PGP attestation. The token is a compact JWT whose signature
//! is checked by a managed key service; the gate never holds the verifying
//! key. This module parses the compact form, enforces the RS256 algorithm,
//! and delegates the actual signature check to a [`TokenKeyResolver`].
//!
//! The only claim the evaluator consumes is `gcp_project`, the project the
//! build ran in.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

use super::errors::CryptoError;

/// Algorithm every build token must declare.
const EXPECTED_ALGORITHM: &str = "RS256";

/// Verifies RS256 signatures through a managed key service.
///
/// `message` is the token signing input (`<header>.<claims>` as raw bytes)
/// and `signature` the decoded signature segment. Implementations return
/// `Ok(())` only when the service confirms the signature; a rejected
/// signature and an unreachable service are both [`CryptoError`]s, which the
/// evaluator records as a violation rather than an admission error.
pub trait TokenKeyResolver: Send + Sync {
    fn verify_rs256(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// Claims carried by a verified build token. Unknown claims are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildTokenClaims {
    /// Project identifier of the build that produced the image.
    #[serde(default)]
    pub gcp_project: Option<String>,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

/// Parses and verifies a compact build token, returning its claims.
///
/// The token must have exactly three segments, declare RS256, and carry a
/// signature the resolver accepts.
pub fn verify_build_token(
    compact: &str,
    resolver: &dyn TokenKeyResolver,
) -> Result<BuildTokenClaims, CryptoError> {
    let mut segments = compact.split('.');
    let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(CryptoError::MalformedToken(
            "expected three dot-separated segments".into(),
        ));
    };

    let header_raw = decode_segment(header_b64, "header")?;
    let header: Header = serde_json::from_slice(&header_raw)
        .map_err(|e| CryptoError::MalformedToken(format!("header: {e}")))?;
    if header.alg != EXPECTED_ALGORITHM {
        return Err(CryptoError::UnexpectedAlgorithm {
            expected: EXPECTED_ALGORITHM.into(),
            got: header.alg,
        });
    }

    let signature = decode_segment(signature_b64, "signature")?;
    let message_len = header_b64.len() + 1 + claims_b64.len();
    let message = compact
        .get(..message_len)
        .ok_or_else(|| CryptoError::MalformedToken("inconsistent segment lengths".into()))?;
    resolver.verify_rs256(message.as_bytes(), &signature)?;

    let claims_raw = decode_segment(claims_b64, "claims")?;
    serde_json::from_slice(&claims_raw)
        .map_err(|e| CryptoError::MalformedToken(format!("claims: {e}")))
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| CryptoError::MalformedToken(format!("{what}: {e}")))
}
