//! The Region/Token Oracle (§4.1): the only component that talks to the platform's
//! metadata endpoint and admin API. Every metadata request sets `Metadata-Flavor: Google`;
//! a non-200 response is an error with the body discarded. No token caching — a failure
//! here always surfaces as a failed request, never a silently-omitted credential.

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;

/// Well-known link-local address of the metadata service. Used by the supervisor's
/// "am I on the platform" heuristic (§9) as well as by the oracle itself.
pub const METADATA_IP: &str = "169.254.169.254";

const METADATA_FLAVOR_HEADER: &str = "Metadata-Flavor";
const METADATA_FLAVOR_VALUE: &str = "Google";
const ZONE_ENDPOINT: &str = "http://metadata.google.internal/computeMetadata/v1/instance/zone";
const IDENTITY_ENDPOINT: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/identity";

const CLOUD_RUN_ID_TOKEN_ENV: &str = "CLOUD_RUN_ID_TOKEN";
const K_SERVICE_ENV: &str = "K_SERVICE";

fn zone_region_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // The authoritative form (§9's Open Question): a regex capture, not a naive split,
    // so that regions with trailing digits (e.g. `us-east4`) are parsed correctly.
    PATTERN.get_or_init(|| Regex::new(r"/zones/([a-z]+-[a-z0-9]+)").expect("static regex"))
}

async fn metadata_get(client: &reqwest::Client, url: &str, query: &[(&str, &str)]) -> Result<String> {
    let resp = client
        .get(url)
        .header(METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE)
        .query(query)
        .send()
        .await
        .with_context(|| format!("metadata request to {url} failed"))?;

    if !resp.status().is_success() {
        let status = resp.status();
        // The body is discarded on error per §4.1 — it's not meaningful to the caller.
        bail!("metadata endpoint {url} returned {status}");
    }

    resp.text()
        .await
        .with_context(|| format!("reading metadata response body from {url}"))
}

/// `region_from_metadata`: fetch the instance zone and extract the region.
pub async fn region_from_metadata(client: &reqwest::Client) -> Result<String> {
    let zone = metadata_get(client, ZONE_ENDPOINT, &[]).await?;
    extract_region_from_zone(&zone)
}

fn extract_region_from_zone(zone: &str) -> Result<String> {
    zone_region_pattern()
        .captures(zone)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("could not parse a region out of zone {zone:?}"))
}

#[derive(Deserialize)]
struct AdminServiceStatus {
    url: String,
}

#[derive(Deserialize)]
struct AdminServiceResponse {
    status: AdminServiceStatus,
}

/// `project_hash`: resolve the deployment's URL via the admin API for the current
/// service name (`K_SERVICE`), then extract the hash segment from its hostname.
pub async fn project_hash(client: &reqwest::Client, region: &str) -> Result<String> {
    let service = std::env::var(K_SERVICE_ENV)
        .with_context(|| format!("{K_SERVICE_ENV} is not set; cannot query the admin API"))?;

    let admin_host = format!("{region}-run.googleapis.com");
    let audience = format!("https://{admin_host}/");
    let token = identity_token(client, &audience).await?;

    let url = format!(
        "https://{admin_host}/apis/serving.knative.dev/v1/namespaces/-/services/{service}"
    );
    let resp = client
        .get(&url)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("admin API request to {url} failed"))?;

    if !resp.status().is_success() {
        let status = resp.status();
        bail!("admin API {url} returned {status}");
    }

    let body: AdminServiceResponse = resp
        .json()
        .await
        .with_context(|| format!("parsing admin API response from {url}"))?;

    extract_hash_from_service_url(&body.status.url)
}

fn extract_hash_from_service_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("parsing service URL {url}"))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow!("service URL {url} has no host"))?;
    let stripped = host
        .strip_suffix(".a.run.app")
        .ok_or_else(|| anyhow!("service URL host {host} does not end in .a.run.app"))?;

    let parts: Vec<&str> = stripped.split('-').collect();
    if parts.len() < 2 {
        bail!("service URL host {host} has too few `-`-separated segments");
    }
    Ok(parts[parts.len() - 2].to_string())
}

/// `identity_token`: an environment override short-circuits the metadata round trip
/// (used for local testing); otherwise fetch a token scoped to `audience`.
pub async fn identity_token(client: &reqwest::Client, audience: &str) -> Result<String> {
    if let Ok(token) = std::env::var(CLOUD_RUN_ID_TOKEN_ENV) {
        return Ok(token.trim().to_string());
    }

    metadata_get(client, IDENTITY_ENDPOINT, &[("audience", audience)])
        .await
        .map(|body| body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_regex_handles_trailing_digits() {
        assert_eq!(
            extract_region_from_zone("projects/123/zones/us-east4-a").unwrap(),
            "us-east4"
        );
    }

    #[test]
    fn region_regex_handles_plain_region() {
        assert_eq!(
            extract_region_from_zone("projects/123/zones/us-central1-b").unwrap(),
            "us-central1"
        );
    }

    #[test]
    fn region_regex_rejects_malformed_zone() {
        assert!(extract_region_from_zone("not-a-zone-string").is_err());
    }

    #[test]
    fn hash_extraction_takes_the_penultimate_segment() {
        let hash = extract_hash_from_service_url("https://hello-dpyb4duzqq-uc.a.run.app").unwrap();
        assert_eq!(hash, "dpyb4duzqq");
    }

    #[test]
    fn hash_extraction_rejects_non_platform_hosts() {
        assert!(extract_hash_from_service_url("https://example.com").is_err());
    }

    #[tokio::test]
    async fn identity_token_env_override_is_trimmed() {
        // SAFETY: test-local env var touched only within this single-threaded test body.
        unsafe { std::env::set_var(CLOUD_RUN_ID_TOKEN_ENV, "  secret-token  \n") };
        let client = reqwest::Client::new();
        let got = identity_token(&client, "https://example.a.run.app").await.unwrap();
        assert_eq!(got, "secret-token");
        unsafe { std::env::remove_var(CLOUD_RUN_ID_TOKEN_ENV) };
    }
}
