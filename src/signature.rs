//! Canonical attestation payload: the atomic container signature.
//!
//! Every PGP attestation in the system signs the same JSON document, the
//! *atomic container signature* payload. It binds a signer identity claim
//! (the full image reference) to the image's manifest digest. Serialization
//! is deterministic: field order is fixed and the optional section is an
//! ordered map, so equal inputs produce byte-identical payloads and any two
//! signatures over the same digest sign the same bytes.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::errors::CryptoError;
use crate::crypto::pgp;
use crate::image;
use crate::secrets::SigningSecret;

/// The payload document signed by every attestation.
///
/// The wire shape follows the container signing convention:
///
/// ```json
/// {
///   "critical": {
///     "identity": { "docker-reference": "<image>" },
///     "image": { "docker-manifest-digest": "sha256:..." },
///     "type": "atomic container signature"
///   },
///   "optional": {}
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicSignature {
    critical: Critical,
    optional: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Critical {
    identity: Identity,
    image: ImageDigest,
    #[serde(rename = "type")]
    type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Identity {
    #[serde(rename = "docker-reference")]
    docker_reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ImageDigest {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

impl AtomicSignature {
    /// Builds the payload for a digest-pinned image reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference carries no (valid) digest; an
    /// attestation cannot bind to a mutable reference.
    pub fn new(image: &str) -> Result<Self> {
        let digest = image::digest(image)
            .ok_or_else(|| anyhow!("{image:?} has no digest to bind an attestation to"))?;
        Ok(Self {
            critical: Critical {
                identity: Identity {
                    docker_reference: image.to_string(),
                },
                image: ImageDigest {
                    docker_manifest_digest: digest.to_string(),
                },
                type_name: "atomic container signature".to_string(),
            },
            optional: BTreeMap::new(),
        })
    }

    /// Deterministic payload bytes: the object signed and verified.
    pub fn payload(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }
}

/// Convenience: payload bytes for an image reference.
pub fn atomic_payload(image: &str) -> Result<Vec<u8>> {
    AtomicSignature::new(image)?.payload()
}

/// Produces a detached attestation signature over the atomic payload for
/// `image`, using the private key in `secret`.
pub fn create_attestation_signature(
    image: &str,
    secret: &SigningSecret,
) -> Result<String, CryptoError> {
    let payload = atomic_payload(image)
        .map_err(|e| CryptoError::SigningFailed(format!("build payload: {e}")))?;
    pgp::sign_detached(&payload, &secret.private_key_armor)
}
