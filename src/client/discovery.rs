//! Pluggable endpoint resolution.

use std::fmt;

use thiserror::Error;

/// A host/port pair the connection manager can dial.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`.
    pub fn parse(raw: &str) -> Result<Self, DiscoveryError> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| DiscoveryError::InvalidEndpoint {
                endpoint: raw.to_string(),
            })?;
        let port = port
            .parse::<u16>()
            .map_err(|_| DiscoveryError::InvalidEndpoint {
                endpoint: raw.to_string(),
            })?;
        if host.is_empty() {
            return Err(DiscoveryError::InvalidEndpoint {
                endpoint: raw.to_string(),
            });
        }
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid endpoint {endpoint:?}, expected host:port")]
    InvalidEndpoint { endpoint: String },
    #[error("no endpoint available: {reason}")]
    NoEndpoint { reason: String },
}

/// Strategy yielding the next address to dial.
///
/// The connection manager consults it once per connect attempt and reports
/// the outcome back. A cluster-aware implementation can poll gossip and
/// steer towards the current master; the default returns a fixed endpoint.
pub trait EndpointResolver: Send {
    fn next_endpoint(&mut self) -> Result<Endpoint, DiscoveryError>;
    fn mark_failed(&mut self, endpoint: &Endpoint);
    fn mark_reachable(&mut self, endpoint: &Endpoint);
}

/// The default resolver: the configured address, every time.
pub struct StaticEndpoint {
    endpoint: Endpoint,
}

impl StaticEndpoint {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }
}

impl EndpointResolver for StaticEndpoint {
    fn next_endpoint(&mut self) -> Result<Endpoint, DiscoveryError> {
        Ok(self.endpoint.clone())
    }

    fn mark_failed(&mut self, endpoint: &Endpoint) {
        tracing::debug!(%endpoint, "endpoint marked failed");
    }

    fn mark_reachable(&mut self, _endpoint: &Endpoint) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parses_host_and_port() {
        let endpoint = Endpoint::parse("db.internal:1113").unwrap();
        assert_eq!(endpoint.host(), "db.internal");
        assert_eq!(endpoint.port(), 1113);
        assert_eq!(endpoint.to_string(), "db.internal:1113");
    }

    #[test]
    fn endpoint_rejects_garbage() {
        assert!(Endpoint::parse("no-port").is_err());
        assert!(Endpoint::parse(":1113").is_err());
        assert!(Endpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn static_resolver_repeats_its_endpoint() {
        let endpoint = Endpoint::new("127.0.0.1", 1113);
        let mut resolver = StaticEndpoint::new(endpoint.clone());
        assert_eq!(resolver.next_endpoint().unwrap(), endpoint);
        resolver.mark_failed(&endpoint);
        assert_eq!(resolver.next_endpoint().unwrap(), endpoint);
    }
}
