use reqwest::{Client, Proxy};
use std::time::Duration;
use tether_core::config::NetworkConfig;
use tether_core::{Error, Result};
use tracing::{info, warn};

/// Outcome of proxy resolution for one target.
#[derive(Debug)]
enum ProxyResolution {
    UseProxy(String),
    /// Configured `""`, or the host is listed in no_proxy.
    ForceDirectConnect,
    /// Nothing configured; reqwest reads HTTPS_PROXY / HTTP_PROXY itself.
    None,
}

/// Host matching for no_proxy rules: exact host, `*.suffix` (subdomains
/// only) and `.suffix` (the domain and its subdomains).
fn is_no_proxy(host: &str, no_proxy_list: &[String]) -> bool {
    let host_lower = host.to_lowercase();
    for rule in no_proxy_list {
        let r = rule.trim().to_lowercase();
        if r.is_empty() {
            continue;
        }
        if let Some(suffix) = r.strip_prefix("*.") {
            if host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if let Some(suffix) = r.strip_prefix('.') {
            if host_lower == suffix || host_lower.ends_with(&format!(".{}", suffix)) {
                return true;
            }
        } else if host_lower == r {
            return true;
        }
    }
    false
}

fn extract_host(url: &str) -> Option<String> {
    let without_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    let host = without_scheme.split('/').next()?.split('@').last()?;
    let host = if host.starts_with('[') {
        host.split(']').next().map(|s| s.trim_start_matches('['))?.to_string()
    } else {
        host.split(':').next()?.to_string()
    };
    Some(host)
}

/// An empty configured proxy forces a direct connection. Otherwise the
/// configured proxy applies unless the target host is in `no_proxy`, and
/// without one reqwest falls back to the environment.
fn resolve_proxy(proxy: Option<&str>, no_proxy: &[String], target: &str) -> ProxyResolution {
    match proxy {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => {
            if let Some(host) = extract_host(target) {
                if is_no_proxy(&host, no_proxy) {
                    return ProxyResolution::ForceDirectConnect;
                }
            }
            ProxyResolution::UseProxy(p.to_string())
        }
        None => ProxyResolution::None,
    }
}

/// Build the reqwest client used by the transport.
///
/// Only a connect timeout is applied. A whole-request timeout would cut
/// long-lived event streams, whose lifetime belongs to the caller.
pub fn build_http_client(network: &NetworkConfig, target: &str) -> Result<Client> {
    let mut builder =
        Client::builder().connect_timeout(Duration::from_secs(network.connect_timeout_secs));

    match resolve_proxy(network.proxy.as_deref(), &network.no_proxy, target) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, target = %target, "Transport using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(target = %target, "Transport forced to direct connect (proxy disabled)");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder
        .build()
        .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))
}
