//! Vulnerability severity lattice and threshold checks.
//!
//! Severities form a total order from [`Severity::Minimal`] up to
//! [`Severity::Critical`]. Policy thresholds add two sentinels on top of the
//! lattice: [`ALLOW_ALL`] (every severity is within the threshold) and
//! [`BLOCK_ALL`] (no severity is). Severity strings arrive from two untrusted
//! directions -- policy documents and backend vulnerability records -- so an
//! unknown literal on either side is a hard error, never a silent pass.

use anyhow::{bail, Result};
use std::fmt;
use std::str::FromStr;

/// Threshold sentinel: every severity satisfies the policy.
pub const ALLOW_ALL: &str = "ALLOW_ALL";

/// Threshold sentinel: no severity satisfies the policy.
pub const BLOCK_ALL: &str = "BLOCK_ALL";

/// Default `maximumSeverity` applied when a policy leaves the field empty.
pub const DEFAULT_MAXIMUM_SEVERITY: &str = "CRITICAL";

/// Default `maximumFixUnavailableSeverity` applied when a policy leaves the
/// field empty.
pub const DEFAULT_MAXIMUM_FIX_UNAVAILABLE_SEVERITY: &str = ALLOW_ALL;

/// A vulnerability severity level, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Canonical upper-case literal for this level.
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Minimal => "MINIMAL",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MINIMAL" => Ok(Severity::Minimal),
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            _ => bail!("invalid severity level: {s}"),
        }
    }
}

/// A policy threshold: a lattice level or one of the two sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    AllowAll,
    BlockAll,
    Level(Severity),
}

impl FromStr for Threshold {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            ALLOW_ALL => Ok(Threshold::AllowAll),
            BLOCK_ALL => Ok(Threshold::BlockAll),
            _ => match s.parse::<Severity>() {
                Ok(level) => Ok(Threshold::Level(level)),
                Err(_) => bail!("invalid maximum severity level: {s}"),
            },
        }
    }
}

/// Returns whether `severity` is within the policy threshold `max_severity`.
///
/// Both arguments are raw strings from policy documents or vulnerability
/// records. `BLOCK_ALL` is never satisfied, `ALLOW_ALL` always is; otherwise
/// the two levels are compared on the lattice order.
///
/// # Errors
///
/// Returns an error if `max_severity` is neither a sentinel nor a lattice
/// level, or if `severity` is not a lattice level.
pub fn within_threshold(max_severity: &str, severity: &str) -> Result<bool> {
    match max_severity.parse::<Threshold>()? {
        Threshold::BlockAll => Ok(false),
        Threshold::AllowAll => Ok(true),
        Threshold::Level(max) => {
            let actual: Severity = severity.parse()?;
            Ok(actual <= max)
        }
    }
}
