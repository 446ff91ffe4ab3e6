//! Hostname resolution for the client's `host` argument. An IP literal is
//! used directly; anything else goes through the system resolver.

use std::net::Ipv4Addr;

use thiserror::Error;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::Resolver;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unable to initialise resolver: {0}")]
    Init(#[source] trust_dns_resolver::error::ResolveError),
    #[error("lookup failed for {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: trust_dns_resolver::error::ResolveError,
    },
    #[error("{host} resolved to no ipv4 address")]
    NoAddress { host: String },
}

/// Resolves `host` to an IPv4 address, skipping the resolver entirely when
/// `host` is already a dotted-quad literal.
pub fn resolve_host(host: &str) -> Result<Ipv4Addr, ResolveError> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }

    let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
        .map_err(ResolveError::Init)?;

    let response = resolver
        .lookup_ip(host)
        .map_err(|source| ResolveError::Lookup {
            host: host.to_string(),
            source,
        })?;

    response
        .iter()
        .find_map(|addr| match addr {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| ResolveError::NoAddress {
            host: host.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literal_bypasses_the_resolver() {
        let addr = resolve_host("203.0.113.7").unwrap();
        assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 7));
    }
}
