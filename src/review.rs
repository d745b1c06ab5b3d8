//! Admission orchestration.
//!
//! [`Reviewer::review`] is the entry point the admission host calls with the
//! pod's images and the policies that apply in its namespace. The reviewer
//! filters whitelisted images, short-circuits images that already carry a
//! valid attestation from a configured authority, delegates the rest to the
//! policy evaluator, reports outcomes through the violation strategy, and --
//! in webhook mode -- mints fresh attestations for images that pass.
//!
//! Failure posture is fail-closed: any error returned here must be turned
//! into a denial by a webhook host. Issuance failures are the one exception;
//! they are aggregated and logged but never block an admission that already
//! passed policy.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};

use crate::crypto::pgp;
use crate::evaluate::{EvalContext, ValidateFn};
use crate::metadata::{self, Fetcher, PgpAttestation};
use crate::policy::{
    remove_globally_whitelisted_images, AttestationAuthority, AttestorFetcher, AuthorityFetcher,
    ImageSecurityPolicy,
};
use crate::secrets::SecretFetcher;
use crate::signature;
use crate::violation::{Pod, Strategy, Violation};

/// Removes cluster-whitelisted images from the candidate set.
pub type ClusterWhitelistRemover = Box<dyn Fn(Vec<String>) -> Result<Vec<String>> + Send + Sync>;

/// Everything the reviewer needs injected.
pub struct Config {
    /// Policy evaluation entry point.
    pub validate: ValidateFn,
    /// Signing-secret store, consulted only during issuance.
    pub secrets: Box<dyn SecretFetcher>,
    /// In-cluster authority resolution.
    pub authorities: Box<dyn AuthorityFetcher>,
    /// External attestor resolution, passed through to the evaluator.
    pub attestors: Box<dyn AttestorFetcher>,
    /// How violations and attestation state are reported.
    pub strategy: Box<dyn Strategy>,
    /// Cluster-level whitelist filter.
    pub cluster_whitelist: ClusterWhitelistRemover,
    /// True when hosted by the admission webhook: enables the attestation
    /// short-circuit and issuance. Audit hosts leave it false so every image
    /// is always fully evaluated.
    pub is_webhook: bool,
    /// Shared evaluation context (build-token config, deadline).
    pub eval: EvalContext,
}

/// Reviews images against image security policies.
pub struct Reviewer<'a> {
    client: &'a dyn Fetcher,
    config: Config,
}

impl<'a> Reviewer<'a> {
    pub fn new(client: &'a dyn Fetcher, config: Config) -> Self {
        Self { client, config }
    }

    /// Reviews `images` against each of `isps`.
    ///
    /// Returns an error if any image violates any policy, or if evaluation
    /// could not complete; webhook hosts must deny on error.
    pub fn review(&self, images: &[String], isps: &[ImageSecurityPolicy], pod: &Pod) -> Result<()> {
        if isps.is_empty() {
            return Ok(());
        }

        let original: Vec<String> = images.to_vec();
        let images = remove_globally_whitelisted_images(original.clone());
        if images.is_empty() {
            info!("images are all globally whitelisted, admitting: {original:?}");
            return Ok(());
        }
        let images = (self.config.cluster_whitelist)(images)
            .context("failed to remove cluster whitelisted images")?;
        if images.is_empty() {
            info!("images are all globally or cluster whitelisted, admitting: {original:?}");
            return Ok(());
        }

        for isp in isps {
            info!("validating against image security policy {:?}", isp.name);
            let authorities = self.authorities_for_isp(isp)?;
            for image in &images {
                self.config.eval.deadline.check("attestation lookup")?;
                let (is_attested, attestations) =
                    self.fetch_and_verify_attestations(image, &authorities, pod);
                if is_attested && self.config.is_webhook {
                    info!("image already has a valid attestation, skipping policy: {image}");
                    continue;
                }

                let violations = (self.config.validate)(
                    isp,
                    image,
                    self.client,
                    self.config.attestors.as_ref(),
                    &self.config.eval,
                )
                .context("failed validating image security policy")?;
                if !violations.is_empty() {
                    return self.handle_violations(image, pod, &violations);
                }
                if self.config.is_webhook {
                    if let Err(e) = self.add_attestations(image, &attestations, isp) {
                        error!("failed to add attestations: {e:#}");
                    }
                }
                info!("found no violations for {image:?} within policy {:?}", isp.name);
            }
        }
        Ok(())
    }

    /// Resolves the authorities a policy names, in policy order. Resolution
    /// failure is fatal for the request.
    fn authorities_for_isp(
        &self,
        isp: &ImageSecurityPolicy,
    ) -> Result<Vec<AttestationAuthority>> {
        isp.spec
            .attestation_authority_names
            .iter()
            .map(|name| {
                self.config
                    .authorities
                    .authority(&isp.namespace, name)
                    .context("failed to get attestation authorities")
            })
            .collect()
    }

    /// Fetches the image's attestations and checks whether any verifies
    /// against a configured authority. The outcome is reported to the
    /// strategy; strategy errors are logged, never fatal.
    fn fetch_and_verify_attestations(
        &self,
        image: &str,
        authorities: &[AttestationAuthority],
        pod: &Pod,
    ) -> (bool, Vec<PgpAttestation>) {
        let attestations = match self.client.attestations(image) {
            Ok(attestations) => attestations,
            Err(e) => {
                error!("error fetching attestations for {image}: {e}");
                return (false, vec![]);
            }
        };
        let is_attested = has_valid_image_attestations(image, &attestations, authorities);
        if let Err(e) = self.config.strategy.handle_attestation(image, pod, is_attested) {
            error!("error handling attestation state for {image}: {e:#}");
        }
        (is_attested, attestations)
    }

    /// Forwards violations to the strategy and returns the aggregated denial
    /// error for the image.
    fn handle_violations(&self, image: &str, pod: &Pod, violations: &[Violation]) -> Result<()> {
        let summaries: Vec<String> = violations
            .iter()
            .map(|v| format!("{}: {}", v.kind(), v.reason()))
            .collect();
        let message = format!(
            "found violations in {image:?} (\n{}\n)",
            summaries.join(",\n")
        );

        self.config
            .strategy
            .handle_violation(image, pod, violations)
            .with_context(|| format!("failed to handle violation: {message}"))?;

        Err(anyhow!(message))
    }

    /// Mints attestations for every configured authority that has not yet
    /// attested `image`. Failures are aggregated into one error for the
    /// caller to log; they never block the admission.
    fn add_attestations(
        &self,
        image: &str,
        attestations: &[PgpAttestation],
        isp: &ImageSecurityPolicy,
    ) -> Result<()> {
        let authorities = self.authorities_for_isp(isp)?;
        if authorities.is_empty() {
            return Err(anyhow!(
                "no attestation authorities configured for security policy {:?}",
                isp.name
            ));
        }

        let fingerprints = authority_fingerprints(&authorities);
        let unattested = unattested_authorities(&authorities, &fingerprints, attestations);
        if unattested.is_empty() {
            info!("attestation exists for all authorities of {image}");
            return Ok(());
        }

        let mut failures: Vec<String> = Vec::new();
        for authority in unattested {
            let note = match metadata::get_or_create_attestation_note(self.client, authority) {
                Ok(note) => note,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };
            let secret = match self
                .config
                .secrets
                .signing_secret(&isp.namespace, &authority.spec.private_key_secret_name)
            {
                Ok(secret) => secret,
                Err(e) => {
                    failures.push(e.to_string());
                    continue;
                }
            };
            match self
                .client
                .create_attestation_occurrence(&note, image, &secret)
            {
                Ok(occurrence) => {
                    info!(
                        "created attestation occurrence {} for {image} under {}",
                        occurrence.id, note.name
                    );
                }
                Err(metadata::MetadataError::AlreadyExists(what)) => {
                    info!("attestation occurrence for {image} under {}: {what} already exists", note.name);
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "one or more errors adding attestations: {}",
                failures.join("; ")
            ))
        }
    }
}

/// Returns whether any attestation verifies against any authority key.
fn has_valid_image_attestations(
    image: &str,
    attestations: &[PgpAttestation],
    authorities: &[AttestationAuthority],
) -> bool {
    if attestations.is_empty() {
        info!(
            "no attestations found for {image}; this is expected for images deployed \
             before the gate or without an attestation authority"
        );
    }
    let payload = match signature::atomic_payload(image) {
        Ok(payload) => payload,
        Err(e) => {
            error!("cannot build attestation payload for {image}: {e}");
            return false;
        }
    };

    let mut keys: HashMap<String, String> = HashMap::new();
    for authority in authorities {
        match armored_authority_key(authority) {
            Ok((armor, fingerprint)) => {
                keys.insert(fingerprint, armor);
            }
            Err(e) => {
                error!("error parsing key for authority {:?}: {e}", authority.name);
            }
        }
    }

    for attestation in attestations {
        let Some(armor) = keys.get(&attestation.key_id) else {
            warn!("attestation key {} matches no configured authority", attestation.key_id);
            continue;
        };
        match pgp::verify_detached(&payload, armor, &attestation.signature) {
            Ok(result) if result.is_valid() => {
                info!("image has valid attestation: {image}, {}", attestation.occurrence_id);
                return true;
            }
            Ok(_) | Err(_) => {
                warn!(
                    "could not verify attestation from key {} for {image}",
                    attestation.key_id
                );
            }
        }
    }
    false
}

/// Decoded armor and fingerprint of an authority's public key.
fn authority_fingerprints(authorities: &[AttestationAuthority]) -> HashMap<String, String> {
    let mut by_name = HashMap::new();
    for authority in authorities {
        match armored_authority_key(authority) {
            Ok((_, fingerprint)) => {
                by_name.insert(authority.name.clone(), fingerprint);
            }
            Err(e) => {
                error!("error parsing key for authority {:?}: {e}", authority.name);
            }
        }
    }
    by_name
}

fn armored_authority_key(
    authority: &AttestationAuthority,
) -> Result<(String, String), crate::crypto::CryptoError> {
    let armor = pgp::decode_public_key_data(&authority.spec.public_key_data)?;
    let fingerprint = pgp::fingerprint(&armor)?;
    Ok((armor, fingerprint))
}

/// Authorities whose key fingerprint is absent from the stored attestations.
/// An authority whose key failed to parse has no fingerprint entry and is
/// treated as unattested.
fn unattested_authorities<'b>(
    authorities: &'b [AttestationAuthority],
    fingerprints: &HashMap<String, String>,
    attestations: &[PgpAttestation],
) -> Vec<&'b AttestationAuthority> {
    let attested: HashSet<&str> = attestations.iter().map(|a| a.key_id.as_str()).collect();
    authorities
        .iter()
        .filter(|authority| {
            fingerprints
                .get(&authority.name)
                .map_or(true, |fpr| !attested.contains(fpr.as_str()))
        })
        .collect()
}
