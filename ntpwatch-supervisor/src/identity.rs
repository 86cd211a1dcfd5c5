//! Server identities and the name resolution that produces them.
//!
//! A configured name fans out to one identity per forward-resolved address,
//! each tagged with the address' reverse-resolved name. Resolution failures
//! never escape: they come back as [`Skipped`] entries so the caller can log
//! them and try again on the next cycle.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

/// Configured name that is sampled through the local clock sampler.
pub const LOCAL_HOST_NAME: &str = "localhost";

/// One monitored server instance. Two identities are the same server iff all
/// three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerIdentity {
    configured_name: String,
    address: IpAddr,
    resolved_name: String,
}

impl ServerIdentity {
    pub fn new(configured_name: impl Into<String>, address: IpAddr, resolved_name: impl Into<String>) -> Self {
        Self {
            configured_name: configured_name.into(),
            address,
            resolved_name: resolved_name.into(),
        }
    }

    /// The identity used for the local host entry.
    pub fn local() -> Self {
        Self::new(LOCAL_HOST_NAME, IpAddr::V4(Ipv4Addr::LOCALHOST), LOCAL_HOST_NAME)
    }

    pub fn configured_name(&self) -> &str {
        &self.configured_name
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn resolved_name(&self) -> &str {
        &self.resolved_name
    }

    pub fn is_local(&self) -> bool {
        is_local_name(&self.configured_name)
    }

    /// Trailing columns of every sample row written for this identity.
    pub fn csv_suffix(&self) -> String {
        format!("{},{},{}", self.configured_name, self.address, self.resolved_name)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.configured_name, self.address, self.resolved_name)
    }
}

fn is_local_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(LOCAL_HOST_NAME)
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("can't resolve {name}: {source}")]
    Forward {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("can't reverse-resolve {address}: {source}")]
    Reverse {
        address: IpAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Name resolution backend.
pub trait Resolver: Send + Sync {
    fn forward(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError>;
    fn reverse(&self, address: IpAddr) -> Result<String, ResolveError>;
}

/// Resolver backed by the host's getaddrinfo / getnameinfo. Blocking.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn forward(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        dns_lookup::lookup_host(name)
            .map(|addrs| addrs.into_iter().collect())
            .map_err(|source| ResolveError::Forward { name: name.to_string(), source })
    }

    fn reverse(&self, address: IpAddr) -> Result<String, ResolveError> {
        dns_lookup::lookup_addr(&address).map_err(|source| ResolveError::Reverse { address, source })
    }
}

/// A name (or one of its addresses) left out of this cycle.
#[derive(Debug)]
pub struct Skipped {
    pub name: String,
    pub address: Option<IpAddr>,
    pub reason: ResolveError,
}

/// Outcome of resolving one batch of configured names.
#[derive(Debug, Default)]
pub struct Resolution {
    pub identities: Vec<ServerIdentity>,
    pub skipped: Vec<Skipped>,
}

/// Resolves every configured name into deduplicated identities.
pub fn resolve<S: AsRef<str>>(resolver: &dyn Resolver, names: &[S]) -> Resolution {
    let mut seen = HashSet::new();
    let mut resolution = Resolution::default();

    for name in names.iter().map(AsRef::as_ref) {
        if is_local_name(name) {
            let local = ServerIdentity::new(name, IpAddr::V4(Ipv4Addr::LOCALHOST), LOCAL_HOST_NAME);
            if seen.insert(local.clone()) {
                resolution.identities.push(local);
            }
            continue;
        }

        let addresses = match resolver.forward(name) {
            Ok(addresses) => addresses,
            Err(reason) => {
                warn!("Can't add server: {name} due to error: {reason}");
                resolution.skipped.push(Skipped { name: name.to_string(), address: None, reason });
                continue;
            }
        };

        for address in addresses {
            match resolver.reverse(address) {
                Ok(resolved_name) => {
                    let identity = ServerIdentity::new(name, address, resolved_name);
                    if seen.insert(identity.clone()) {
                        resolution.identities.push(identity);
                    }
                }
                Err(reason) => {
                    warn!("Skipping address {address} of server {name}: {reason}");
                    resolution.skipped.push(Skipped {
                        name: name.to_string(),
                        address: Some(address),
                        reason,
                    });
                }
            }
        }
    }

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;

    #[derive(Default)]
    struct TableResolver {
        forward: HashMap<String, Vec<IpAddr>>,
        reverse: HashMap<IpAddr, String>,
    }

    impl TableResolver {
        fn host(mut self, name: &str, addrs: &[&str]) -> Self {
            let addrs: Vec<IpAddr> = addrs.iter().map(|a| a.parse().unwrap()).collect();
            self.forward.insert(name.to_string(), addrs);
            self
        }

        fn ptr(mut self, addr: &str, name: &str) -> Self {
            self.reverse.insert(addr.parse().unwrap(), name.to_string());
            self
        }
    }

    impl Resolver for TableResolver {
        fn forward(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
            self.forward.get(name).cloned().ok_or_else(|| ResolveError::Forward {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such host"),
            })
        }

        fn reverse(&self, address: IpAddr) -> Result<String, ResolveError> {
            self.reverse.get(&address).cloned().ok_or_else(|| ResolveError::Reverse {
                address,
                source: io::Error::new(io::ErrorKind::NotFound, "no PTR record"),
            })
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_identity_equality_uses_all_fields() {
        let a = ServerIdentity::new("alpha", ip("10.0.0.5"), "alpha.example");
        let b = ServerIdentity::new("alpha", ip("10.0.0.5"), "alpha.example");
        let c = ServerIdentity::new("alpha", ip("10.0.0.5"), "other.example");

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a.clone(), b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.csv_suffix(), "alpha,10.0.0.5,alpha.example");
    }

    #[test]
    fn test_resolve_scenario() {
        let resolver = TableResolver::default()
            .host("alpha", &["10.0.0.5"])
            .ptr("10.0.0.5", "alpha.example");

        let resolution = resolve(&resolver, &["alpha", "localhost"]);

        assert!(resolution.skipped.is_empty());
        let mut identities = resolution.identities;
        identities.sort();
        assert_eq!(
            identities,
            vec![
                ServerIdentity::new("alpha", ip("10.0.0.5"), "alpha.example"),
                ServerIdentity::local(),
            ]
        );
        assert!(identities[1].is_local());
    }

    #[test]
    fn test_forward_failure_skips_name() {
        let resolver = TableResolver::default()
            .host("beta", &["10.0.0.6"])
            .ptr("10.0.0.6", "beta.example");

        let resolution = resolve(&resolver, &["gone", "beta"]);

        assert_eq!(resolution.identities.len(), 1);
        assert_eq!(resolution.skipped.len(), 1);
        assert_eq!(resolution.skipped[0].name, "gone");
        assert!(resolution.skipped[0].address.is_none());
        assert!(matches!(resolution.skipped[0].reason, ResolveError::Forward { .. }));
    }

    #[test]
    fn test_reverse_failure_skips_only_that_address() {
        let resolver = TableResolver::default()
            .host("pool", &["10.0.1.1", "10.0.1.2", "10.0.1.3"])
            .ptr("10.0.1.1", "a.pool")
            .ptr("10.0.1.3", "c.pool");

        let resolution = resolve(&resolver, &["pool"]);

        let addresses: Vec<_> = resolution.identities.iter().map(|i| i.address()).collect();
        assert_eq!(addresses, vec![ip("10.0.1.1"), ip("10.0.1.3")]);
        assert_eq!(resolution.skipped.len(), 1);
        assert_eq!(resolution.skipped[0].address, Some(ip("10.0.1.2")));
    }

    #[test]
    fn test_same_address_under_two_names_kept_twice() {
        let resolver = TableResolver::default()
            .host("ntp1", &["10.0.0.9"])
            .host("ntp-alias", &["10.0.0.9", "10.0.0.9"])
            .ptr("10.0.0.9", "ntp1.example");

        let resolution = resolve(&resolver, &["ntp1", "ntp-alias", "ntp1"]);

        assert_eq!(resolution.identities.len(), 2);
        let names: HashSet<_> = resolution.identities.iter().map(|i| i.configured_name()).collect();
        assert_eq!(names, HashSet::from(["ntp1", "ntp-alias"]));
    }
}
