//! End-to-end admission flows against an in-memory metadata backend.
//!
//! These tests run the real reviewer, evaluator, and PGP verification stack
//! together, using the checked-in armored keys. They cover the full webhook
//! loop: first admission evaluates policy and mints an attestation, the
//! second admission short-circuits on it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use image_gate::crypto::pgp;
use image_gate::evaluate::{validate_image_security_policy, EvalContext, ValidateFn};
use image_gate::metadata::{
    self, Fetcher, MetadataError, Note, Occurrence, PgpAttestation, RawOccurrence, Vulnerability,
};
use image_gate::policy::{
    AttestationAuthority, Attestor, AttestorFetcher, AuthorityFetcher, ImageSecurityPolicy,
};
use image_gate::secrets::{SecretFetcher, SigningSecret};
use image_gate::signature;
use image_gate::violation::{MemoryStrategy, Pod, Strategy, Violation};
use image_gate::{Config, Deadline, Reviewer};

const DIGEST: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const AUTHORITY_PUB: &str = include_str!("fixtures/auth1.pub.asc");
const AUTHORITY_SEC: &str = include_str!("fixtures/auth1.sec.asc");

fn demo_image() -> String {
    format!("gcr.io/demo-project/web@{DIGEST}")
}

/// In-memory stand-in for the metadata backend. Occurrence writes are
/// idempotent keyed by `(note, image, key id)`, like the real store.
#[derive(Default)]
struct InMemoryBackend {
    vulnz: Mutex<Vec<Vulnerability>>,
    attestations: Mutex<Vec<PgpAttestation>>,
    vulnz_reads: AtomicUsize,
}

impl Fetcher for InMemoryBackend {
    fn vulnerabilities(&self, image: &str) -> Result<Vec<Vulnerability>, MetadataError> {
        metadata::ensure_recognized_registry(image)?;
        self.vulnz_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.vulnz.lock().map_err(poisoned)?.clone())
    }

    fn attestations(&self, image: &str) -> Result<Vec<PgpAttestation>, MetadataError> {
        metadata::ensure_recognized_registry(image)?;
        Ok(self.attestations.lock().map_err(poisoned)?.clone())
    }

    fn raw_occurrences(&self, image: &str) -> Result<Vec<RawOccurrence>, MetadataError> {
        metadata::ensure_recognized_registry(image)?;
        Ok(vec![])
    }

    fn attestation_note(&self, authority: &AttestationAuthority) -> Result<Note, MetadataError> {
        metadata::note_name(authority).map(|name| Note { name })
    }

    fn create_attestation_note(
        &self,
        authority: &AttestationAuthority,
    ) -> Result<Note, MetadataError> {
        metadata::note_name(authority).map(|name| Note { name })
    }

    fn create_attestation_occurrence(
        &self,
        note: &Note,
        image: &str,
        secret: &SigningSecret,
    ) -> Result<Occurrence, MetadataError> {
        metadata::ensure_recognized_registry(image)?;
        let key_id = pgp::secret_key_fingerprint(&secret.private_key_armor)
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        let id = format!("{}/occurrences/{image}/{key_id}", note.name);
        let mut attestations = self.attestations.lock().map_err(poisoned)?;
        if attestations.iter().any(|a| a.occurrence_id == id) {
            return Err(MetadataError::AlreadyExists(format!("occurrence {id}")));
        }
        let sig = signature::create_attestation_signature(image, secret)
            .map_err(|e| MetadataError::Transport(e.to_string()))?;
        attestations.push(PgpAttestation {
            key_id,
            signature: sig,
            occurrence_id: id.clone(),
        });
        Ok(Occurrence { id })
    }
}

fn poisoned<T>(_: T) -> MetadataError {
    MetadataError::Transport("store poisoned".into())
}

struct SingleAuthority(AttestationAuthority);

impl AuthorityFetcher for SingleAuthority {
    fn authority(&self, namespace: &str, name: &str) -> Result<AttestationAuthority> {
        if self.0.namespace == namespace && self.0.name == name {
            Ok(self.0.clone())
        } else {
            Err(anyhow!("authority not found: {namespace}/{name}"))
        }
    }
}

struct NoAttestors;

impl AttestorFetcher for NoAttestors {
    fn attestor(&self, _: &str) -> Result<Option<Attestor>> {
        Ok(None)
    }
}

struct StaticAttestors(Vec<Attestor>);

impl AttestorFetcher for StaticAttestors {
    fn attestor(&self, name: &str) -> Result<Option<Attestor>> {
        Ok(self.0.iter().find(|a| a.name == name).cloned())
    }
}

struct AuthoritySecrets;

impl SecretFetcher for AuthoritySecrets {
    fn signing_secret(&self, _namespace: &str, name: &str) -> Result<SigningSecret> {
        Ok(SigningSecret {
            name: name.into(),
            private_key_armor: AUTHORITY_SEC.into(),
            public_key_armor: AUTHORITY_PUB.into(),
        })
    }
}

struct SharedStrategy(Arc<MemoryStrategy>);

impl Strategy for SharedStrategy {
    fn handle_violation(&self, image: &str, pod: &Pod, violations: &[Violation]) -> Result<()> {
        self.0.handle_violation(image, pod, violations)
    }
    fn handle_attestation(&self, image: &str, pod: &Pod, is_attested: bool) -> Result<()> {
        self.0.handle_attestation(image, pod, is_attested)
    }
}

fn authority() -> AttestationAuthority {
    let mut auth = AttestationAuthority::default();
    auth.name = "prod-authority".into();
    auth.namespace = "prod".into();
    auth.spec.note_reference = "v1beta1/projects/attest-proj".into();
    auth.spec.public_key_data = STANDARD.encode(AUTHORITY_PUB);
    auth.spec.private_key_secret_name = "authority-key".into();
    auth
}

fn isp() -> ImageSecurityPolicy {
    let mut isp = ImageSecurityPolicy::default();
    isp.name = "prod-policy".into();
    isp.namespace = "prod".into();
    isp.spec.attestation_authority_names = vec!["prod-authority".into()];
    isp
}

fn real_validate() -> ValidateFn {
    Box::new(|isp, image, client, attestors, ctx| {
        validate_image_security_policy(isp, image, client, attestors, ctx)
    })
}

fn webhook_config(strategy: Arc<MemoryStrategy>, deadline: Deadline) -> Config {
    Config {
        validate: real_validate(),
        secrets: Box::new(AuthoritySecrets),
        authorities: Box::new(SingleAuthority(authority())),
        attestors: Box::new(NoAttestors),
        strategy: Box::new(SharedStrategy(strategy)),
        cluster_whitelist: Box::new(|images| Ok(images)),
        is_webhook: true,
        eval: EvalContext {
            build_token: None,
            deadline,
        },
    }
}

#[test]
fn clean_image_is_admitted_and_attested() {
    let backend = InMemoryBackend::default();
    let strategy = Arc::new(MemoryStrategy::default());
    let reviewer = Reviewer::new(&backend, webhook_config(strategy.clone(), Deadline::none()));

    reviewer
        .review(&[demo_image()], &[isp()], &Pod::default())
        .unwrap();

    let attestations = backend.attestations.lock().unwrap();
    assert_eq!(attestations.len(), 1, "admission mints exactly one attestation");

    // The minted attestation is a real detached signature over the atomic
    // payload, verifiable with the authority's public key.
    let payload = signature::atomic_payload(&demo_image()).unwrap();
    let result =
        pgp::verify_detached(&payload, AUTHORITY_PUB, &attestations[0].signature).unwrap();
    assert!(result.is_valid());
    assert_eq!(
        attestations[0].key_id,
        pgp::fingerprint(AUTHORITY_PUB).unwrap()
    );

    // First pass saw the image as unattested.
    assert_eq!(
        strategy.attestations.lock().unwrap().as_slice(),
        &[(demo_image(), false)]
    );
}

#[test]
fn second_admission_short_circuits_on_minted_attestation() {
    let backend = InMemoryBackend::default();
    let strategy = Arc::new(MemoryStrategy::default());
    let reviewer = Reviewer::new(&backend, webhook_config(strategy.clone(), Deadline::none()));

    reviewer
        .review(&[demo_image()], &[isp()], &Pod::default())
        .unwrap();
    let reads_after_first = backend.vulnz_reads.load(Ordering::SeqCst);
    assert_eq!(reads_after_first, 1);

    // Poison the backend with a blocking vulnerability; the short-circuit
    // must admit without ever fetching it.
    backend.vulnz.lock().unwrap().push(Vulnerability {
        cve: "CVE-2024-9999".into(),
        severity: "CRITICAL".into(),
        has_fix_available: false,
    });
    let mut strict = isp();
    strict.spec.package_vulnerability_requirements.maximum_severity = "LOW".into();
    strict
        .spec
        .package_vulnerability_requirements
        .maximum_fix_unavailable_severity = "LOW".into();

    reviewer
        .review(&[demo_image()], &[strict], &Pod::default())
        .unwrap();
    assert_eq!(backend.vulnz_reads.load(Ordering::SeqCst), reads_after_first);
    assert_eq!(
        strategy.attestations.lock().unwrap().last().unwrap(),
        &(demo_image(), true)
    );
}

#[test]
fn issuance_is_idempotent() {
    let backend = InMemoryBackend::default();
    let strategy = Arc::new(MemoryStrategy::default());

    // Two policies naming the same authority in one request: the second pass
    // sees the minted attestation and must not create another occurrence.
    let reviewer = Reviewer::new(&backend, webhook_config(strategy, Deadline::none()));
    reviewer
        .review(&[demo_image()], &[isp(), isp()], &Pod::default())
        .unwrap();
    assert_eq!(backend.attestations.lock().unwrap().len(), 1);

    // A racing writer that repeats the same (note, image, key) write gets
    // AlreadyExists, and the store still holds one occurrence.
    let note = backend.attestation_note(&authority()).unwrap();
    let secret = AuthoritySecrets
        .signing_secret("prod", "authority-key")
        .unwrap();
    let err = backend
        .create_attestation_occurrence(&note, &demo_image(), &secret)
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));
    assert_eq!(
        backend.attestations.lock().unwrap().len(),
        1,
        "at most one net occurrence per (authority, image)"
    );
}

#[test]
fn whitelisted_image_ignores_backend_state() {
    let backend = InMemoryBackend::default();
    backend.vulnz.lock().unwrap().push(Vulnerability {
        cve: "CVE-2024-0001".into(),
        severity: "CRITICAL".into(),
        has_fix_available: true,
    });
    let mut policy = isp();
    policy.spec.image_whitelist = vec![demo_image()];
    policy.spec.package_vulnerability_requirements.maximum_severity = "LOW".into();

    let strategy = Arc::new(MemoryStrategy::default());
    let reviewer = Reviewer::new(&backend, webhook_config(strategy.clone(), Deadline::none()));
    reviewer
        .review(&[demo_image()], &[policy], &Pod::default())
        .unwrap();
    assert!(strategy.violations.lock().unwrap().is_empty());
}

#[test]
fn violating_image_is_denied() {
    let backend = InMemoryBackend::default();
    backend.vulnz.lock().unwrap().push(Vulnerability {
        cve: "CVE-2024-0001".into(),
        severity: "HIGH".into(),
        has_fix_available: true,
    });
    let mut policy = isp();
    policy.spec.package_vulnerability_requirements.maximum_severity = "MEDIUM".into();

    let strategy = Arc::new(MemoryStrategy::default());
    let reviewer = Reviewer::new(&backend, webhook_config(strategy.clone(), Deadline::none()));
    let err = reviewer
        .review(&[demo_image()], &[policy], &Pod::default())
        .unwrap_err();
    assert!(err.to_string().contains("found violations in"));
    assert!(err.to_string().contains("CVE-2024-0001"));

    let recorded = strategy.violations.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(recorded[0].1, Violation::Severity { .. }));

    // Denied admissions never mint attestations.
    assert!(backend.attestations.lock().unwrap().is_empty());
}

#[test]
fn tag_qualified_image_without_digest_is_denied_not_errored() {
    // A tag-qualified reference passes qualification but has no digest for
    // an attestation to bind to; a required-attestor policy must deny it
    // with a structured violation, not abort evaluation.
    let backend = InMemoryBackend::default();
    let mut policy = isp();
    policy.spec.require_attestations_by = vec!["build-bot".into()];

    let strategy = Arc::new(MemoryStrategy::default());
    let mut cfg = webhook_config(strategy.clone(), Deadline::none());
    cfg.attestors = Box::new(StaticAttestors(vec![Attestor {
        name: "build-bot".into(),
        public_keys: vec![],
    }]));
    let reviewer = Reviewer::new(&backend, cfg);

    let err = reviewer
        .review(
            &["gcr.io/demo-project/web:v1.2.3".to_string()],
            &[policy],
            &Pod::default(),
        )
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("found violations in"));
    assert!(message.contains("required attestation violation"));
    assert!(!message.contains("failed validating image security policy"));

    let recorded = strategy.violations.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(recorded[0].1, Violation::RequiredAttestation { .. }));
    assert!(recorded[0].1.reason().contains("no digest"));
}

#[test]
fn expired_deadline_denies() {
    let backend = InMemoryBackend::default();
    let strategy = Arc::new(MemoryStrategy::default());
    let deadline = Deadline::at(Instant::now() - Duration::from_millis(1));
    let reviewer = Reviewer::new(&backend, webhook_config(strategy, deadline));

    let err = reviewer
        .review(&[demo_image()], &[isp()], &Pod::default())
        .unwrap_err();
    assert!(err.to_string().contains("deadline exceeded"));
}

#[test]
fn unrecognized_registry_is_a_backend_error() {
    let backend = InMemoryBackend::default();
    let strategy = Arc::new(MemoryStrategy::default());
    let reviewer = Reviewer::new(&backend, webhook_config(strategy, Deadline::none()));

    let image = format!("quay.io/demo-project/web@{DIGEST}");
    let err = reviewer
        .review(&[image], &[isp()], &Pod::default())
        .unwrap_err();
    assert!(err.to_string().contains("failed validating image security policy"));
}
