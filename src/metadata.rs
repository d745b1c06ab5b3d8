//! Typed facade over the occurrence/note metadata backend.
//!
//! The backend stores three things the gate cares about: package
//! vulnerability occurrences, PGP attestation occurrences, and raw
//! occurrences carrying signed build tokens. [`Fetcher`] is the seam between
//! the evaluation core and any concrete backend (or the in-memory doubles
//! used in tests).
//!
//! Implementations must reject images outside the recognised registry before
//! touching the wire; [`ensure_recognized_registry`] is the shared gate for
//! that. Occurrence writes are idempotent keyed by `(note, image, key id)`:
//! a duplicate create surfaces as [`MetadataError::AlreadyExists`], which
//! issuance treats as success.

use std::fmt;

use crate::policy::AttestationAuthority;
use crate::secrets::SigningSecret;

/// A package vulnerability reported against an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vulnerability {
    pub cve: String,
    /// Severity literal from the lattice; validated at evaluation time.
    pub severity: String,
    pub has_fix_available: bool,
}

/// A stored PGP attestation: a detached signature plus the fingerprint of
/// the key that made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpAttestation {
    /// Upper-case hex fingerprint of the signing key.
    pub key_id: String,
    /// Detached, ASCII-armored signature over the atomic payload.
    pub signature: String,
    /// Backend identifier of the occurrence.
    pub occurrence_id: String,
}

/// A raw occurrence, surfaced only to find signed build tokens attached
/// under a configured note.
#[derive(Debug, Clone, Default)]
pub struct RawOccurrence {
    /// Note the occurrence is filed under.
    pub note_name: String,
    /// Compact JWTs attached to the occurrence.
    pub compact_jwts: Vec<String>,
}

/// Handle to an authority's attestation note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    /// Fully qualified note name, `projects/<project>/notes/<authority>`.
    pub name: String,
}

/// Handle to a created attestation occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub id: String,
}

/// Errors surfaced by the metadata backend.
#[derive(Debug, Clone)]
pub enum MetadataError {
    /// The image is not hosted in a registry the backend indexes.
    UnrecognizedRegistry(String),
    /// An authority's note reference is not `<api>/projects/<project_id>`.
    InvalidNoteReference(String),
    /// The occurrence already exists; writes are idempotent so callers
    /// treat this as success.
    AlreadyExists(String),
    /// Transport or backend failure.
    Transport(String),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedRegistry(image) => {
                write!(f, "{image:?} is not a valid image hosted in a recognised registry")
            }
            Self::InvalidNoteReference(r) => {
                write!(
                    f,
                    "invalid note reference {r:?}, should be in format <api>/projects/<project_id>"
                )
            }
            Self::AlreadyExists(what) => write!(f, "{what} already exists"),
            Self::Transport(msg) => write!(f, "metadata backend error: {msg}"),
        }
    }
}

impl std::error::Error for MetadataError {}

/// Typed view over the metadata backend.
pub trait Fetcher {
    /// Package vulnerabilities recorded for `image`.
    fn vulnerabilities(&self, image: &str) -> Result<Vec<Vulnerability>, MetadataError>;

    /// PGP attestation occurrences recorded for `image`.
    fn attestations(&self, image: &str) -> Result<Vec<PgpAttestation>, MetadataError>;

    /// Raw occurrences for `image`, used to locate signed build tokens.
    fn raw_occurrences(&self, image: &str) -> Result<Vec<RawOccurrence>, MetadataError>;

    /// Fetches the attestation note owned by `authority`, if it exists.
    fn attestation_note(&self, authority: &AttestationAuthority) -> Result<Note, MetadataError>;

    /// Creates the attestation note owned by `authority`.
    fn create_attestation_note(
        &self,
        authority: &AttestationAuthority,
    ) -> Result<Note, MetadataError>;

    /// Signs the atomic payload for `image` with `secret` and records the
    /// attestation occurrence under `note`.
    fn create_attestation_occurrence(
        &self,
        note: &Note,
        image: &str,
        secret: &SigningSecret,
    ) -> Result<Occurrence, MetadataError>;
}

/// Rejects images whose host is not a `gcr.io` registry (any zone). Backend
/// implementations call this before issuing any RPC.
pub fn ensure_recognized_registry(image: &str) -> Result<(), MetadataError> {
    let host = image.split('/').next().unwrap_or_default();
    let labels: Vec<&str> = host.split('.').collect();
    let recognized = labels.len() >= 2
        && labels.get(labels.len() - 2) == Some(&"gcr")
        && labels.last() == Some(&"io");
    if recognized {
        Ok(())
    } else {
        Err(MetadataError::UnrecognizedRegistry(image.to_string()))
    }
}

/// Extracts the project segment from an authority's note reference
/// (`<api>/projects/<project_id>`).
pub fn note_project(note_reference: &str) -> Result<&str, MetadataError> {
    let mut parts = note_reference.split('/');
    let (_api, projects, project) = (parts.next(), parts.next(), parts.next());
    match (projects, project) {
        (Some("projects"), Some(p)) if !p.is_empty() => Ok(p),
        _ => Err(MetadataError::InvalidNoteReference(
            note_reference.to_string(),
        )),
    }
}

/// Fully qualified note name for an authority.
pub fn note_name(authority: &AttestationAuthority) -> Result<String, MetadataError> {
    let project = note_project(&authority.spec.note_reference)?;
    Ok(format!("projects/{project}/notes/{}", authority.name))
}

/// Fetches the authority's note, creating it on first use.
pub fn get_or_create_attestation_note(
    client: &dyn Fetcher,
    authority: &AttestationAuthority,
) -> Result<Note, MetadataError> {
    match client.attestation_note(authority) {
        Ok(note) => Ok(note),
        Err(MetadataError::InvalidNoteReference(r)) => {
            Err(MetadataError::InvalidNoteReference(r))
        }
        Err(_) => client.create_attestation_note(authority),
    }
}
