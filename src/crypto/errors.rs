//! Error type for the gate's cryptographic operations.
//!
//! Errors describe *what* failed (malformed key, unexpected algorithm) but
//! never include raw key bytes or signature data in their `Display` output,
//! so they are safe to log and to embed in violation reasons.

use std::fmt;

/// Errors produced while verifying or issuing attestations.
#[derive(Debug, Clone)]
pub enum CryptoError {
    /// Key material is malformed (bad armor, bad encoding, not a key).
    InvalidKeyMaterial(String),

    /// A signature blob could not be parsed at all.
    InvalidSignature(String),

    /// Producing a detached signature failed.
    SigningFailed(String),

    /// A token or signature declared an algorithm the gate does not accept.
    UnexpectedAlgorithm {
        /// Algorithm the gate requires.
        expected: String,
        /// Algorithm actually declared.
        got: String,
    },

    /// A compact token is structurally invalid (wrong segment count, bad
    /// base64, unparseable header or claims).
    MalformedToken(String),

    /// The key-resolution backend failed or rejected the token signature.
    KeyResolution(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyMaterial(msg) => write!(f, "invalid key material: {msg}"),
            Self::InvalidSignature(msg) => write!(f, "invalid signature: {msg}"),
            Self::SigningFailed(msg) => write!(f, "signing failed: {msg}"),
            Self::UnexpectedAlgorithm { expected, got } => {
                write!(f, "unexpected signing algorithm: want {expected}, got {got}")
            }
            Self::MalformedToken(msg) => write!(f, "malformed token: {msg}"),
            Self::KeyResolution(msg) => write!(f, "key resolution failed: {msg}"),
        }
    }
}

impl std::error::Error for CryptoError {}
