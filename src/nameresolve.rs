//! The Name Mapper (§4.2): a pure function from a short or qualified internal name to
//! the platform's canonical HTTPS hostname. No I/O, no state — this is the one
//! authoritative mapping consulted by both the DNS hijack server and the reverse proxy.

use anyhow::{anyhow, bail, Result};

/// Resolve `host` (as seen on an internal name, e.g. `hello` or `hello.us-central1`)
/// to the canonical platform hostname `{svc}-{project_hash}-{region_code}.a.run.app`.
pub fn resolve(internal_zone: &str, host: &str, current_region: &str, project_hash: &str) -> Result<String> {
    let host = host.to_ascii_lowercase();
    let host = host.trim_end_matches('.');

    if !host.contains('.') {
        return canonical_host(host, current_region, project_hash);
    }

    let zone = internal_zone.trim_matches('.');
    let dotted_zone = format!(".{zone}");
    let stripped = match host.strip_suffix(dotted_zone.as_str()) {
        Some(rest) => rest.trim_end_matches('.'),
        None => host,
    };

    match stripped.split('.').collect::<Vec<_>>().as_slice() {
        [svc, region] => canonical_host(svc, region, project_hash),
        _ => bail!("malformed internal hostname: {host}"),
    }
}

fn canonical_host(svc: &str, region: &str, project_hash: &str) -> Result<String> {
    let code = crate::region::lookup(region).ok_or_else(|| anyhow!("unknown region: {region}"))?;
    Ok(format!("{svc}-{project_hash}-{code}.a.run.app"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    const ZONE: &str = "run.internal.";

    #[test]
    fn bare_short_name_uses_current_region() {
        let got = resolve(ZONE, "hello", "us-central1", "dpyb4duzqq").unwrap();
        assert_eq!(got, "hello-dpyb4duzqq-uc.a.run.app");
    }

    #[test]
    fn qualified_short_name_uses_embedded_region() {
        let got = resolve(ZONE, "hello.europe-west1", "us-central1", "dpyb4duzqq").unwrap();
        assert_eq!(got, "hello-dpyb4duzqq-ew.a.run.app");
    }

    #[test]
    fn fully_qualified_name_strips_the_zone() {
        let got = resolve(ZONE, "hello.europe-west1.run.internal.", "us-central1", "dpyb4duzqq").unwrap();
        assert_eq!(got, "hello-dpyb4duzqq-ew.a.run.app");
    }

    #[test]
    fn the_three_forms_are_equivalent() {
        let a = resolve(ZONE, "svc", "asia-east1", "hash1").unwrap();
        let b = resolve(ZONE, "svc.asia-east1", "asia-east1", "hash1").unwrap();
        let c = resolve(ZONE, "svc.asia-east1.run.internal.", "asia-east1", "hash1").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn too_many_labels_is_an_error() {
        assert!(resolve(ZONE, "a.b.c.run.internal.", "us-central1", "h").is_err());
        assert!(resolve(ZONE, "a.b.c", "us-central1", "h").is_err());
    }

    #[test]
    fn unknown_region_is_an_error() {
        assert!(resolve(ZONE, "svc.nowhere1", "us-central1", "h").is_err());
    }

    #[test]
    fn zone_suffix_without_a_preceding_dot_is_not_stripped() {
        // "svc.us-central1run.internal" is not actually inside the internal zone — the
        // label boundary before "run.internal" is missing — so it must not be accepted
        // as a fully qualified internal name even though the bare string "run.internal"
        // appears at the end of it.
        assert!(resolve(ZONE, "svc.us-central1run.internal", "us-central1", "h").is_err());
    }

    #[test]
    fn is_case_insensitive() {
        let got = resolve(ZONE, "HELLO", "US-CENTRAL1".to_ascii_lowercase().as_str(), "h").unwrap();
        assert_eq!(got, "hello-h-uc.a.run.app");
    }

    #[test]
    fn output_matches_canonical_hostname_shape() {
        let re = Regex::new(r"^[a-z0-9-]+-[a-z0-9]+-[a-z]{2}\.a\.run\.app$").unwrap();
        let got = resolve(ZONE, "hello-world", "us-west2", "abc123").unwrap();
        assert!(re.is_match(&got), "{got} does not match canonical shape");
    }
}
