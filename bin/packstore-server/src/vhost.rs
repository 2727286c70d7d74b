//! Virtual host lookup.

use axum::http::{HeaderMap, header};
use packstore_common::{Error, Result, VhostConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// Host name to virtual host configuration
#[derive(Debug, Default)]
pub struct Vhosts {
    by_host: HashMap<String, Arc<VhostConfig>>,
}

impl Vhosts {
    #[must_use]
    pub fn new(configs: &[VhostConfig]) -> Self {
        let mut by_host = HashMap::new();
        for config in configs {
            let config = Arc::new(config.clone());
            for host in &config.hosts {
                by_host.insert(host.to_ascii_lowercase(), Arc::clone(&config));
            }
        }
        Self { by_host }
    }

    /// Resolve the virtual host named by the request's `Host` header
    pub fn resolve(&self, headers: &HeaderMap) -> Result<Arc<VhostConfig>> {
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::invalid_request("missing Host header"))?;
        let name = host_name(host).to_ascii_lowercase();
        self.by_host
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::invalid_request(format!("unknown host '{name}'")))
    }
}

/// Strip the port from a `Host` header value
fn host_name(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split_once(']').map_or(host, |(addr, _)| addr);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
