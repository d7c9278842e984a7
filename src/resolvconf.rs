//! Resolver file handling (§3 "Resolver file"): read the existing configuration to pick
//! an upstream nameserver, then rewrite it exactly once with the loopback nameservers,
//! a prepended search list, and the configured `ndots`.

use crate::config::RuntimeConfig;
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::Path;

const DNS_PORT: u16 = 53;

/// The resolver file as read at bootstrap: the first `nameserver` line (used as the
/// recursion target absent a flag override) and whatever `search` domains already exist.
pub struct ExistingResolvConf {
    pub first_nameserver: Option<SocketAddr>,
    pub search_domains: Vec<String>,
}

pub async fn read(path: &Path) -> Result<ExistingResolvConf> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading resolver file {}", path.display()))?;
    Ok(parse(&contents))
}

fn parse(contents: &str) -> ExistingResolvConf {
    let mut first_nameserver = None;
    let mut search_domains = Vec::new();

    for line in contents.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("nameserver") {
            let addr = rest.trim();
            if first_nameserver.is_none()
                && let Ok(ip) = addr.parse::<std::net::IpAddr>()
            {
                first_nameserver = Some(SocketAddr::new(ip, DNS_PORT));
            }
        } else if let Some(rest) = line.strip_prefix("search") {
            search_domains.extend(rest.split_whitespace().map(str::to_string));
        }
    }

    ExistingResolvConf {
        first_nameserver,
        search_domains,
    }
}

/// Pick the upstream nameserver per §4.5 step 2: flag override, else the first entry
/// already in the resolver file, else a fatal configuration error.
pub fn pick_upstream(
    flag_override: Option<SocketAddr>,
    existing: &ExistingResolvConf,
) -> Result<SocketAddr> {
    if let Some(addr) = flag_override {
        return Ok(addr);
    }
    existing
        .first_nameserver
        .ok_or_else(|| anyhow::anyhow!("no nameserver found in resolver file and none supplied by flag"))
}

/// Render the rewritten resolver file contents (§3): one `nameserver` per loopback
/// family, a single `search` line prepending the new domains to whatever already
/// existed, and `options ndots:{ndots}`.
pub fn render(config: &RuntimeConfig, existing_search: &[String]) -> String {
    let mut out = String::new();
    out.push_str("nameserver 127.0.0.1\n");
    if config.serve_ipv6 {
        out.push_str("nameserver ::1\n");
    }

    let mut search = config.search_domains().to_vec();
    search.extend(existing_search.iter().cloned());
    out.push_str("search ");
    out.push_str(&search.join(" "));
    out.push('\n');

    out.push_str(&format!("options ndots:{}\n", config.ndots));
    out
}

pub async fn write(path: &Path, contents: &str) -> Result<()> {
    if contents.trim().is_empty() {
        bail!("refusing to write an empty resolver file to {}", path.display());
    }
    tokio::fs::write(path, contents)
        .await
        .with_context(|| format!("writing resolver file {}", path.display()))
}
