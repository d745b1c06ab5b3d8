//! Detached OpenPGP signatures over attestation payloads.
//!
//! Attestations are detached, ASCII-armored signatures over the canonical
//! image payload. This module wraps the `pgp` crate (pure Rust) for the three
//! operations the gate needs: verifying a detached signature against an
//! armored public key, computing the key fingerprint that identifies an
//! authority, and producing a new detached signature from a signing secret.
//!
//! Fingerprints are upper-case hex of the primary key fingerprint; they are
//! the canonical identifier matched against attestation key IDs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{SubsecRound, Utc};
use pgp::crypto::hash::HashAlgorithm;
use pgp::packet::{SignatureConfig, SignatureType, SignatureVersion, Subpacket, SubpacketData};
use pgp::types::KeyTrait;
use pgp::{Deserializable, SignedPublicKey, SignedSecretKey, StandaloneSignature};

use super::errors::CryptoError;
use super::VerificationResult;

/// Decodes base64-encoded public key data (as stored on an authority
/// resource) into the armored key text.
pub fn decode_public_key_data(encoded: &str) -> Result<String, CryptoError> {
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("base64 decode: {e}")))?;
    String::from_utf8(raw)
        .map_err(|_| CryptoError::InvalidKeyMaterial("public key data is not ASCII armor".into()))
}

/// Computes the upper-case hex fingerprint of an armored public key.
pub fn fingerprint(armored_public_key: &str) -> Result<String, CryptoError> {
    let (key, _) = SignedPublicKey::from_string(armored_public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("parse public key: {e}")))?;
    Ok(hex::encode_upper(key.fingerprint()))
}

/// Computes the upper-case hex fingerprint of an armored secret key. Used
/// when issuing an attestation, so the recorded key ID matches what
/// [`fingerprint`] reports for the paired public key.
pub fn secret_key_fingerprint(armored_secret_key: &str) -> Result<String, CryptoError> {
    let (key, _) = SignedSecretKey::from_string(armored_secret_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("parse secret key: {e}")))?;
    Ok(hex::encode_upper(key.fingerprint()))
}

/// Verifies a detached, armored signature over `payload`.
///
/// A mismatching signature is a normal outcome and is reported as
/// [`VerificationResult::Invalid`]; only unusable inputs (bad armor, bad key)
/// produce an error. The signature is checked against the primary key and
/// every signing subkey.
pub fn verify_detached(
    payload: &[u8],
    armored_public_key: &str,
    armored_signature: &str,
) -> Result<VerificationResult, CryptoError> {
    let (key, _) = SignedPublicKey::from_string(armored_public_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("parse public key: {e}")))?;
    let (sig, _) = StandaloneSignature::from_string(armored_signature)
        .map_err(|e| CryptoError::InvalidSignature(format!("parse signature: {e}")))?;

    if sig.verify(&key, payload).is_ok() {
        return Ok(VerificationResult::Valid);
    }
    for subkey in &key.public_subkeys {
        if sig.verify(subkey, payload).is_ok() {
            return Ok(VerificationResult::Valid);
        }
    }
    Ok(VerificationResult::Invalid {
        reason: "signature does not match payload and key".into(),
    })
}

/// Produces a detached, armored signature over `payload` with the given
/// armored secret key.
pub fn sign_detached(payload: &[u8], armored_secret_key: &str) -> Result<String, CryptoError> {
    let (key, _) = SignedSecretKey::from_string(armored_secret_key)
        .map_err(|e| CryptoError::InvalidKeyMaterial(format!("parse secret key: {e}")))?;

    let config = SignatureConfig::new_v4(
        SignatureVersion::V4,
        SignatureType::Binary,
        key.algorithm(),
        HashAlgorithm::SHA2_256,
        vec![
            Subpacket::regular(SubpacketData::SignatureCreationTime(
                Utc::now().trunc_subsecs(0),
            )),
            Subpacket::regular(SubpacketData::Issuer(key.key_id())),
        ],
        vec![],
    );

    let signature = config
        .sign(&key, String::new, payload)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;

    StandaloneSignature::new(signature)
        .to_armored_string(None)
        .map_err(|e| CryptoError::SigningFailed(format!("armor signature: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const AUTHORITY_PUB: &str = include_str!("../../tests/fixtures/auth1.pub.asc");
    const AUTHORITY_SEC: &str = include_str!("../../tests/fixtures/auth1.sec.asc");
    const OTHER_PUB: &str = include_str!("../../tests/fixtures/bot.pub.asc");
    const PAYLOAD: &[u8] = include_bytes!("../../tests/fixtures/payload.json");
    const PAYLOAD_SIG: &str = include_str!("../../tests/fixtures/payload.asc");

    const AUTHORITY_FPR: &str = "8E49E2BA7617F246390B20409BAB057E4E3EC814";

    #[test]
    fn fingerprint_matches_known_value() {
        assert_eq!(fingerprint(AUTHORITY_PUB).unwrap(), AUTHORITY_FPR);
    }

    #[test]
    fn secret_and_public_fingerprints_agree() {
        assert_eq!(
            secret_key_fingerprint(AUTHORITY_SEC).unwrap(),
            fingerprint(AUTHORITY_PUB).unwrap()
        );
    }

    #[test]
    fn verifies_externally_produced_signature() {
        let result = verify_detached(PAYLOAD, AUTHORITY_PUB, PAYLOAD_SIG).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn sign_then_verify_round_trip() {
        let sig = sign_detached(PAYLOAD, AUTHORITY_SEC).unwrap();
        let result = verify_detached(PAYLOAD, AUTHORITY_PUB, &sig).unwrap();
        assert!(result.is_valid());
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let result = verify_detached(PAYLOAD, OTHER_PUB, PAYLOAD_SIG).unwrap();
        assert!(!result.is_valid());
    }

    #[test]
    fn tampered_payload_does_not_verify() {
        let mut tampered = PAYLOAD.to_vec();
        tampered[0] ^= 0xFF;
        let result = verify_detached(&tampered, AUTHORITY_PUB, PAYLOAD_SIG).unwrap();
        assert!(!result.is_valid());
    }

    #[test]
    fn garbage_key_is_an_error() {
        let err = verify_detached(PAYLOAD, "not a key", PAYLOAD_SIG).unwrap_err();
        assert!(err.to_string().contains("invalid key material"));
    }

    #[test]
    fn garbage_signature_is_an_error() {
        let err = verify_detached(PAYLOAD, AUTHORITY_PUB, "not a signature").unwrap_err();
        assert!(err.to_string().contains("invalid signature"));
    }

    #[test]
    fn decode_public_key_data_round_trip() {
        let encoded = STANDARD.encode(AUTHORITY_PUB);
        assert_eq!(decode_public_key_data(&encoded).unwrap(), AUTHORITY_PUB);
    }

    #[test]
    fn decode_public_key_data_rejects_bad_base64() {
        assert!(decode_public_key_data("!!!").is_err());
    }
}
