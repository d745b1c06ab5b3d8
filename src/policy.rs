//! Policy and authority resources.
//!
//! [`ImageSecurityPolicy`] is the namespaced, declarative policy the gate
//! enforces. [`AttestationAuthority`] is the in-cluster signer identity used
//! for the attestation short-circuit and for issuing new attestations.
//! [`Attestor`] is the external (binary-authorization) identity referenced by
//! `requireAttestationsBy`; the two name spaces are distinct and never mixed.
//!
//! Documents are JSON with the upstream camelCase field names. Unknown fields
//! are ignored so newer resource schemas remain readable, and every field
//! defaults to empty so partial policies parse; empty severity strings pick
//! up their documented defaults at evaluation time, not here.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Images the gate itself ships; always exempt so the gate cannot block its
/// own rollout.
pub const GLOBAL_IMAGE_WHITELIST: &[&str] = &[
    "gcr.io/image-gate-project/gate-server",
    "gcr.io/image-gate-project/gate-preinstall",
    "gcr.io/image-gate-project/gate-postinstall",
];

/// A namespaced image security policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageSecurityPolicy {
    pub name: String,
    pub namespace: String,
    pub spec: ImageSecurityPolicySpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageSecurityPolicySpec {
    /// Exact image references exempt from evaluation.
    pub image_whitelist: Vec<String>,
    pub package_vulnerability_requirements: PackageVulnerabilityRequirements,
    /// Permitted builder/registry project identifiers; empty disables the
    /// builder check.
    #[serde(rename = "builtProjectIDs")]
    pub built_project_ids: Vec<String>,
    /// Attestor names whose attestations must be present; empty disables.
    pub require_attestations_by: Vec<String>,
    /// In-cluster authorities participating in short-circuit and issuance.
    pub attestation_authority_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PackageVulnerabilityRequirements {
    /// Severity ceiling for fixable vulnerabilities. Empty means CRITICAL.
    pub maximum_severity: String,
    /// Severity ceiling for vulnerabilities without a fix. Empty means
    /// ALLOW_ALL.
    pub maximum_fix_unavailable_severity: String,
    /// CVE identifiers to ignore entirely.
    #[serde(rename = "whitelistCVEs")]
    pub whitelist_cves: Vec<String>,
}

/// An in-cluster attestation authority: a PGP public key plus a reference to
/// the signing secret that can speak for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttestationAuthority {
    pub name: String,
    pub namespace: String,
    pub spec: AttestationAuthoritySpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttestationAuthoritySpec {
    /// Backend note handle, `<api>/projects/<project_id>`.
    pub note_reference: String,
    /// Base64-encoded ASCII-armored PGP public key.
    pub public_key_data: String,
    /// Name of the signing secret in the policy namespace.
    pub private_key_secret_name: String,
}

/// An external attestor with one or more published public keys.
#[derive(Debug, Clone, Default)]
pub struct Attestor {
    pub name: String,
    pub public_keys: Vec<AttestorPublicKey>,
}

#[derive(Debug, Clone, Default)]
pub struct AttestorPublicKey {
    /// Key identifier; equals the key fingerprint.
    pub id: String,
    /// ASCII-armored PGP public key.
    pub ascii_armor: String,
}

/// Resolves in-cluster attestation authorities by `(namespace, name)`.
pub trait AuthorityFetcher: Send + Sync {
    fn authority(&self, namespace: &str, name: &str) -> Result<AttestationAuthority>;
}

/// Resolves external attestors by name. `Ok(None)` means the attestor does
/// not exist, which the evaluator treats as a configuration error.
pub trait AttestorFetcher: Send + Sync {
    fn attestor(&self, name: &str) -> Result<Option<Attestor>>;
}

impl ImageSecurityPolicy {
    /// Returns whether `image` is exactly whitelisted by this policy.
    pub fn whitelists_image(&self, image: &str) -> bool {
        self.spec.image_whitelist.iter().any(|i| i == image)
    }

    /// Returns whether `cve` is whitelisted by this policy.
    pub fn whitelists_cve(&self, cve: &str) -> bool {
        self.spec
            .package_vulnerability_requirements
            .whitelist_cves
            .iter()
            .any(|c| c == cve)
    }
}

/// Drops images that match the gate's own infrastructure list. The reference
/// is compared without its tag or digest, so any version of a gate image is
/// exempt.
pub fn remove_globally_whitelisted_images(images: Vec<String>) -> Vec<String> {
    images
        .into_iter()
        .filter(|image| {
            let bare = image.split_once('@').map_or(image.as_str(), |(r, _)| r);
            let bare = match bare.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => repo,
                _ => bare,
            };
            !GLOBAL_IMAGE_WHITELIST.contains(&bare)
        })
        .collect()
}
