//! # image-gate -- admission-time image security gate
//!
//! The policy evaluation core of a Kubernetes admission gate for container
//! images. Given the images of a pod under admission and the image security
//! policies that apply in its namespace, the gate decides whether the pod is
//! admitted, denied, or flagged, based on vulnerability data, build
//! provenance, and cryptographic attestations.
//!
//! The crate is the *core* only: the webhook surface, the resource store,
//! the metadata backend, the secret store, and the managed key service are
//! external collaborators reached through traits ([`metadata::Fetcher`],
//! [`policy::AuthorityFetcher`], [`policy::AttestorFetcher`],
//! [`secrets::SecretFetcher`], [`crypto::jwt::TokenKeyResolver`],
//! [`violation::Strategy`]).
//!
//! ## Security Properties
//!
//! - **`#![forbid(unsafe_code)]`**: no `unsafe` anywhere in the crate.
//! - **Fail closed**: any error during evaluation denies the admission;
//!   deadline expiry aborts rather than admitting.
//! - **Verification failure is data**: a bad signature is a violation or an
//!   `is_attested = false`, never a panic and never a silent pass.
//! - **Key hygiene**: private key material lives only in
//!   [`secrets::SigningSecret`], which zeroizes on drop and redacts `Debug`.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`image`] | Reference qualification, registry membership, project extraction |
//! | [`severity`] | Severity lattice with `ALLOW_ALL` / `BLOCK_ALL` sentinels |
//! | [`signature`] | Canonical atomic container signature payload |
//! | [`crypto`] | Detached PGP verification/issuance, signed build tokens |
//! | [`metadata`] | Typed facade over the occurrence/note backend |
//! | [`secrets`] | Signing-secret record and fetcher seam |
//! | [`policy`] | Policy, authority, and attestor resources |
//! | [`violation`] | Violation values and the reporting strategy seam |
//! | [`evaluate`] | One policy against one image |
//! | [`review`] | Admission orchestration, short-circuit, issuance |
//! | [`deadline`] | Cooperative admission deadlines |

#![forbid(unsafe_code)]

pub mod crypto;
pub mod deadline;
pub mod evaluate;
pub mod image;
pub mod metadata;
pub mod policy;
pub mod review;
pub mod secrets;
pub mod severity;
pub mod signature;
pub mod violation;

pub use deadline::Deadline;
pub use evaluate::{validate_image_security_policy, BuildTokenConfig, EvalContext, ValidateFn};
pub use policy::{AttestationAuthority, Attestor, ImageSecurityPolicy};
pub use review::{Config, Reviewer};
pub use violation::{Pod, Strategy, Violation};
