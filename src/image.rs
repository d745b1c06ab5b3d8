//! Container image reference handling.
//!
//! The gate only reasons about images it can pin down: a reference is *fully
//! qualified* when it carries a digest, or (for compatibility with resolved
//! manifests) a registry host plus an explicit non-`latest` tag. Everything
//! else is rejected before any backend lookup happens.
//!
//! Registry membership checks are positional: hosted images look like
//! `<zone>.gcr.io/<project>/<path>[@<digest>|:<tag>]`, where the zone prefix
//! is one of the serving regions or absent entirely.

use regex::Regex;

/// Zone prefixes of the recognised registry. The empty entry stands for the
/// bare `gcr.io` host.
const REGISTRY_ZONES: &[&str] = &["", "asia", "eu", "us"];

/// Returns the digest portion (`sha256:<hex>`) of a reference, if present
/// and well formed.
pub fn digest(image: &str) -> Option<&str> {
    let (_, d) = image.split_once('@')?;
    // Compiled per call; reference parsing is far off any hot path.
    let re = Regex::new(r"^sha256:[a-f0-9]{64}$").ok()?;
    re.is_match(d).then_some(d)
}

/// Returns whether `image` is fully qualified: digest-pinned, or tagged with
/// an explicit non-`latest` tag on a registry-qualified reference.
pub fn is_fully_qualified(image: &str) -> bool {
    if image.contains('@') {
        return digest(image).is_some();
    }
    let (repo, tag) = split_tag(image);
    !tag.is_empty() && tag != "latest" && has_registry_host(repo)
}

/// Returns whether `image` is hosted under `projectId` in any zone of the
/// recognised registry.
pub fn in_registry(project_id: &str, image: &str) -> bool {
    REGISTRY_ZONES.iter().any(|zone| {
        let host = if zone.is_empty() {
            "gcr.io".to_string()
        } else {
            format!("{zone}.gcr.io")
        };
        image.starts_with(&format!("{host}/{project_id}/"))
    })
}

/// Extracts the positional project segment (the path element right after the
/// registry host).
pub fn project(image: &str) -> Option<&str> {
    let mut parts = image.split('/');
    let _host = parts.next()?;
    let project = parts.next()?;
    // The project segment may be the last element and still carry a tag or
    // digest suffix; strip it.
    let project = project.split_once('@').map_or(project, |(p, _)| p);
    let project = project.split_once(':').map_or(project, |(p, _)| p);
    (!project.is_empty()).then_some(project)
}

/// Resource URL used by backend occurrence filters.
pub fn resource_url(image: &str) -> String {
    format!("https://{image}")
}

/// Splits `name[:tag]` into the repository and tag parts, taking care not to
/// confuse a registry port (`host:5000/...`) for a tag.
fn split_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, ""),
    }
}

fn has_registry_host(repo: &str) -> bool {
    let Some((host, _)) = repo.split_once('/') else {
        return false;
    };
    host.contains('.') || host.contains(':') || host == "localhost"
}
