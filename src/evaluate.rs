//! Policy evaluation: one policy against one image.
//!
//! [`validate_image_security_policy`] is the single entry point. It runs the
//! checks in a fixed order -- image whitelist, qualification, vulnerability
//! scan, signed build token, builder project, required attestors -- and
//! returns the violations it finds, in that order. An empty list means the
//! policy is satisfied.
//!
//! Violations and errors travel separately: `Err` means the evaluation could
//! not complete (backend failure, unknown severity literal, missing
//! attestor) and the caller must fail closed, while a non-empty `Ok` means
//! the policy ran to completion and failed. Per-signature verification
//! failures are violations, never errors.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};

use crate::crypto::jwt::{self, BuildTokenClaims, TokenKeyResolver};
use crate::crypto::pgp;
use crate::deadline::Deadline;
use crate::image;
use crate::metadata::{Fetcher, RawOccurrence};
use crate::policy::{Attestor, AttestorFetcher, ImageSecurityPolicy};
use crate::severity::{
    within_threshold, DEFAULT_MAXIMUM_FIX_UNAVAILABLE_SEVERITY, DEFAULT_MAXIMUM_SEVERITY,
};
use crate::signature;
use crate::violation::Violation;

/// Configuration for the signed-build-token check.
///
/// Hosts map this from their deployment environment (conventionally the
/// `ARKCI_SIGNATURE_NOTE` and `ARKCI_KMS_SIGNER_KEY` settings); the core
/// never reads the process environment itself.
#[derive(Clone)]
pub struct BuildTokenConfig {
    /// Note name under which signed build tokens are filed.
    pub signature_note: String,
    /// When `true`, an image with no token under the note is a violation.
    /// The default preserves the permissive behavior: absent tokens are
    /// ignored and only present-but-invalid tokens violate.
    pub require_token: bool,
    /// Managed-key-service verifier for token signatures.
    pub resolver: Arc<dyn TokenKeyResolver>,
}

/// Per-request evaluation context: optional build-token configuration plus
/// the admission deadline.
#[derive(Clone, Default)]
pub struct EvalContext {
    pub build_token: Option<BuildTokenConfig>,
    pub deadline: Deadline,
}

/// Signature of the evaluation entry point, injectable so the reviewer can
/// be exercised against canned evaluations.
pub type ValidateFn = Box<
    dyn Fn(
            &ImageSecurityPolicy,
            &str,
            &dyn Fetcher,
            &dyn AttestorFetcher,
            &EvalContext,
        ) -> Result<Vec<Violation>>
        + Send
        + Sync,
>;

/// Checks whether `image` satisfies `isp`, returning all violations found.
pub fn validate_image_security_policy(
    isp: &ImageSecurityPolicy,
    image: &str,
    client: &dyn Fetcher,
    attestors: &dyn AttestorFetcher,
    ctx: &EvalContext,
) -> Result<Vec<Violation>> {
    if isp.whitelists_image(image) {
        info!("{image:?} is whitelisted in image security policy {:?}", isp.name);
        return Ok(vec![]);
    }

    let mut violations = Vec::new();

    if !image::is_fully_qualified(image) {
        violations.push(Violation::UnqualifiedImage {
            reason: format!("{image} is not a fully qualified image"),
        });
        return Ok(violations);
    }

    ctx.deadline.check("vulnerability scan")?;
    let vulnz = client.vulnerabilities(image)?;

    let requirements = &isp.spec.package_vulnerability_requirements;
    let max_severity = non_empty_or(&requirements.maximum_severity, DEFAULT_MAXIMUM_SEVERITY);
    let max_no_fix_severity = non_empty_or(
        &requirements.maximum_fix_unavailable_severity,
        DEFAULT_MAXIMUM_FIX_UNAVAILABLE_SEVERITY,
    );

    for v in vulnz {
        if isp.whitelists_cve(&v.cve) {
            continue;
        }
        if !v.has_fix_available {
            if within_threshold(max_no_fix_severity, &v.severity)? {
                continue;
            }
            violations.push(Violation::FixUnavailable {
                reason: format!(
                    "found CVE {} in {image} which has fix unavailable, and severity {} \
                     exceeding max fix unavailable severity {max_no_fix_severity}",
                    v.cve, v.severity
                ),
                vulnerability: v,
            });
            continue;
        }
        if within_threshold(max_severity, &v.severity)? {
            continue;
        }
        violations.push(Violation::Severity {
            reason: format!(
                "found CVE {} in {image} which has severity {} exceeding max severity \
                 {max_severity}",
                v.cve, v.severity
            ),
            vulnerability: v,
        });
    }

    let signed_project_id = check_signed_build_tokens(image, client, ctx, &mut violations)?;

    if !isp.spec.built_project_ids.is_empty() {
        let permitted = isp.spec.built_project_ids.iter().any(|project| {
            Some(project.as_str()) == signed_project_id.as_deref()
                || image::in_registry(project, image)
        });
        if !permitted {
            violations.push(Violation::BuiltProjectId {
                reason: format!(
                    "{image:?} doesn't come from a permitted project: [{}]",
                    isp.spec.built_project_ids.join(",")
                ),
            });
        }
    }

    if !isp.spec.require_attestations_by.is_empty() {
        ctx.deadline.check("required attestation check")?;
        let attestations = client.attestations(image)?;
        // A reference qualified by tag alone carries no digest for an
        // attestation to bind to, so no stored attestation can satisfy the
        // requirement; that is a violation per attestor, not an error.
        let payload = match signature::atomic_payload(image) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("no attestation payload for {image}: {e}");
                None
            }
        };
        for required in &isp.spec.require_attestations_by {
            let attestor = attestors
                .attestor(required)
                .with_context(|| format!("failed to get attestor: {required}"))?
                .ok_or_else(|| anyhow!("attestor not found: {required}"))?;
            match payload.as_deref() {
                Some(payload) => {
                    if !has_required_attestation(payload, image, &attestor, &attestations) {
                        violations.push(Violation::RequiredAttestation {
                            reason: format!(
                                "{image:?} doesn't have a required attestation: [{required}]"
                            ),
                        });
                    }
                }
                None => {
                    violations.push(Violation::RequiredAttestation {
                        reason: format!(
                            "{image:?} has no digest for a required attestation from \
                             [{required}] to bind to"
                        ),
                    });
                }
            }
        }
    }

    Ok(violations)
}

/// Runs the signed-build-token check, appending violations for invalid (or
/// required-but-missing) tokens and returning the project identifier claimed
/// by the last valid token.
fn check_signed_build_tokens(
    image: &str,
    client: &dyn Fetcher,
    ctx: &EvalContext,
    violations: &mut Vec<Violation>,
) -> Result<Option<String>> {
    let Some(config) = &ctx.build_token else {
        return Ok(None);
    };

    ctx.deadline.check("signed build token check")?;
    let occurrences = client.raw_occurrences(image)?;

    let mut signed_project_id = None;
    let mut found_token = false;
    for occ in &occurrences {
        if occ.note_name != config.signature_note {
            continue;
        }
        found_token = true;
        match verify_occurrence_token(occ, config.resolver.as_ref()) {
            Ok(claims) => {
                info!("signed build token verified for {image}");
                signed_project_id = Some(claims.gcp_project.unwrap_or_default());
            }
            Err(e) => {
                violations.push(Violation::JwtSignature {
                    reason: format!("failed to verify signed build token: {e}"),
                });
            }
        }
    }

    if config.require_token && !found_token {
        violations.push(Violation::JwtSignature {
            reason: format!(
                "no signed build token found for {image} under note {:?}",
                config.signature_note
            ),
        });
    }

    Ok(signed_project_id)
}

/// Verifies the token on a single occurrence.
fn verify_occurrence_token(
    occ: &RawOccurrence,
    resolver: &dyn TokenKeyResolver,
) -> Result<BuildTokenClaims, crate::crypto::CryptoError> {
    let Some(compact) = occ.compact_jwts.first() else {
        return Err(crate::crypto::CryptoError::MalformedToken(
            "no token found on occurrence".into(),
        ));
    };
    jwt::verify_build_token(compact, resolver)
}

/// Returns whether any stored attestation verifies against any of the
/// attestor's keys. Verification failures are logged and skipped.
fn has_required_attestation(
    payload: &[u8],
    image: &str,
    attestor: &Attestor,
    attestations: &[crate::metadata::PgpAttestation],
) -> bool {
    for attestation in attestations {
        for key in &attestor.public_keys {
            if key.id != attestation.key_id {
                continue;
            }
            match pgp::verify_detached(payload, &key.ascii_armor, &attestation.signature) {
                Ok(result) if result.is_valid() => return true,
                Ok(_) => {
                    warn!(
                        "attestation signature mismatch for key {} on {image}",
                        attestation.key_id
                    );
                }
                Err(e) => {
                    warn!(
                        "could not verify attestation for key {} on {image}: {e}",
                        attestation.key_id
                    );
                }
            }
        }
    }
    false
}

fn non_empty_or<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() {
        default
    } else {
        value
    }
}
