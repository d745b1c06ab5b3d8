//! Policy violations and the strategy seam that reports them.
//!
//! Violations are plain values, never errors: an evaluation that finds
//! violations still *succeeds*, and the reviewer decides what to do with the
//! result. The [`Strategy`] trait is the only interface through which the
//! core touches the pod under admission; swapping the strategy changes the
//! enforcement posture (deny, annotate, audit-log) without touching
//! evaluation.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use log::{info, warn};

use crate::metadata::Vulnerability;

/// A single policy violation found for an image.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    /// The image reference is not pinned well enough to evaluate.
    UnqualifiedImage { reason: String },
    /// A fixable vulnerability exceeds the policy's severity ceiling.
    Severity {
        vulnerability: Vulnerability,
        reason: String,
    },
    /// An unfixable vulnerability exceeds the fix-unavailable ceiling.
    FixUnavailable {
        vulnerability: Vulnerability,
        reason: String,
    },
    /// A signed build token failed verification (or was required and absent).
    JwtSignature { reason: String },
    /// The image was not built in any permitted project.
    BuiltProjectId { reason: String },
    /// A required attestor has not attested this image.
    RequiredAttestation { reason: String },
}

impl Violation {
    /// Stable name of the violation kind, used in operator-facing summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnqualifiedImage { .. } => "unqualified image violation",
            Self::Severity { .. } => "severity violation",
            Self::FixUnavailable { .. } => "fix unavailable violation",
            Self::JwtSignature { .. } => "jwt signature violation",
            Self::BuiltProjectId { .. } => "built project id violation",
            Self::RequiredAttestation { .. } => "required attestation violation",
        }
    }

    /// Human-readable reason for the violation.
    pub fn reason(&self) -> &str {
        match self {
            Self::UnqualifiedImage { reason }
            | Self::Severity { reason, .. }
            | Self::FixUnavailable { reason, .. }
            | Self::JwtSignature { reason }
            | Self::BuiltProjectId { reason }
            | Self::RequiredAttestation { reason } => reason,
        }
    }

    /// The offending vulnerability, present only on vulnerability kinds.
    pub fn vulnerability(&self) -> Option<&Vulnerability> {
        match self {
            Self::Severity { vulnerability, .. } | Self::FixUnavailable { vulnerability, .. } => {
                Some(vulnerability)
            }
            _ => None,
        }
    }
}

/// Minimal view of the pod under admission, for strategies that annotate or
/// log per-workload context.
#[derive(Debug, Clone, Default)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
}

/// How violations and attestation state are surfaced.
pub trait Strategy: Send + Sync {
    /// Reports the violations found for `image`.
    fn handle_violation(&self, image: &str, pod: &Pod, violations: &[Violation]) -> Result<()>;

    /// Reports whether `image` carried a valid prior attestation.
    fn handle_attestation(&self, image: &str, pod: &Pod, is_attested: bool) -> Result<()>;
}

/// Strategy that reports through the `log` facade and never blocks.
#[derive(Debug, Default)]
pub struct LoggingStrategy;

impl Strategy for LoggingStrategy {
    fn handle_violation(&self, image: &str, pod: &Pod, violations: &[Violation]) -> Result<()> {
        for v in violations {
            warn!(
                "image {image} in pod {}/{}: {}: {}",
                pod.namespace,
                pod.name,
                v.kind(),
                v.reason()
            );
        }
        Ok(())
    }

    fn handle_attestation(&self, image: &str, _pod: &Pod, is_attested: bool) -> Result<()> {
        info!("image {image} attested: {is_attested}");
        Ok(())
    }
}

/// Strategy that records everything in memory. Used by audit-mode hosts and
/// by tests to observe what the reviewer reported.
#[derive(Debug, Default)]
pub struct MemoryStrategy {
    pub violations: Mutex<Vec<(String, Violation)>>,
    pub attestations: Mutex<Vec<(String, bool)>>,
}

impl Strategy for MemoryStrategy {
    fn handle_violation(&self, image: &str, _pod: &Pod, violations: &[Violation]) -> Result<()> {
        let mut seen = self
            .violations
            .lock()
            .map_err(|_| anyhow::anyhow!("violation store poisoned"))?;
        for v in violations {
            seen.push((image.to_string(), v.clone()));
        }
        Ok(())
    }

    fn handle_attestation(&self, image: &str, _pod: &Pod, is_attested: bool) -> Result<()> {
        self.attestations
            .lock()
            .map_err(|_| anyhow::anyhow!("attestation store poisoned"))?
            .push((image.to_string(), is_attested));
        Ok(())
    }
}
