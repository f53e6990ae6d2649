use std::fmt::Debug;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::{SocketError, SocketException};
use crate::model::address::SocketAddress;

/// Turns socket addresses into network endpoints on the proxy side
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Resolver: Debug + Send + Sync + 'static {
    /// All endpoints for an address. Fails with [SocketError::NoHost] if there are none.
    async fn resolve(&self, address: &SocketAddress) -> anyhow::Result<Vec<SocketAddr>>;

    /// The first endpoint that accepts a connection. Without a port there is nothing to probe,
    ///  and the first resolved endpoint is returned as is.
    async fn probe(&self, address: &SocketAddress) -> Option<SocketAddr>;
}

#[derive(Debug)]
pub struct DnsResolver {
    probe_timeout: Duration,
}

impl DnsResolver {
    pub fn new(probe_timeout: Duration) -> DnsResolver {
        DnsResolver { probe_timeout }
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, address: &SocketAddress) -> anyhow::Result<Vec<SocketAddr>> {
        let result = match address.remote() {
            SocketAddress::Any => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)],
            SocketAddress::ProxyName(name) => {
                lookup_host((name.host.as_str(), name.port)).await
                    .map(|addrs| addrs.collect())
                    .unwrap_or_else(|e| {
                        debug!("lookup of {} failed: {}", name.host, e);
                        Vec::new()
                    })
            }
            SocketAddress::Collection(addresses) => {
                let mut result = Vec::new();
                for a in addresses {
                    if let Ok(mut resolved) = self.resolve(a).await {
                        result.append(&mut resolved);
                    }
                }
                result
            }
            other => other.to_socket_addr().into_iter().collect(),
        };

        if result.is_empty() {
            return Err(SocketException::new(SocketError::NoHost, format!("{} does not resolve", address)).into());
        }
        Ok(result)
    }

    async fn probe(&self, address: &SocketAddress) -> Option<SocketAddr> {
        let endpoints = self.resolve(address).await.ok()?;
        if address.port() == 0 {
            return endpoints.into_iter().next();
        }

        let mut probes = JoinSet::new();
        for endpoint in endpoints {
            let timeout = self.probe_timeout;
            probes.spawn(async move {
                match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
                    Ok(Ok(_)) => Some(endpoint),
                    Ok(Err(e)) => {
                        trace!("probe of {} failed: {}", endpoint, e);
                        None
                    }
                    Err(_) => {
                        trace!("probe of {} timed out", endpoint);
                        None
                    }
                }
            });
        }

        while let Some(result) = probes.join_next().await {
            if let Ok(Some(endpoint)) = result {
                return Some(endpoint);
            }
        }
        None
    }
}


#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;
    use tokio::net::TcpListener;

    use super::*;
    use crate::error::socket_error_of;

    #[rstest]
    #[case::inet("10.1.2.3:80", vec!["10.1.2.3:80"])]
    #[case::localhost("localhost:80", vec!["127.0.0.1:80"])]
    #[case::any("", vec!["0.0.0.0:0"])]
    #[tokio::test]
    async fn test_resolve(#[case] address: &str, #[case] expected: Vec<&str>) {
        let resolver = DnsResolver::new(Duration::from_secs(1));
        let resolved = resolver.resolve(&SocketAddress::from_str(address).unwrap()).await.unwrap();
        for e in expected {
            assert!(resolved.contains(&SocketAddr::from_str(e).unwrap()), "{:?}", resolved);
        }
    }

    #[tokio::test]
    async fn test_resolve_unix_fails() {
        let resolver = DnsResolver::new(Duration::from_secs(1));
        let err = resolver.resolve(&SocketAddress::Unix { path: "/tmp/x".to_string() }).await.err().unwrap();
        assert_eq!(socket_error_of(&err), SocketError::NoHost);
    }

    #[tokio::test]
    async fn test_probe_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let resolver = DnsResolver::new(Duration::from_secs(1));

        let reached = resolver.probe(&SocketAddress::from_str(&format!("127.0.0.1:{}", port)).unwrap()).await;
        assert_eq!(reached, Some(listener.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let resolver = DnsResolver::new(Duration::from_secs(1));
        assert_eq!(resolver.probe(&SocketAddress::from(addr)).await, None);
    }

    #[tokio::test]
    async fn test_probe_without_port_is_not_active() {
        let resolver = DnsResolver::new(Duration::from_secs(1));
        let reached = resolver.probe(&SocketAddress::from_str("10.255.255.1").unwrap()).await;
        assert_eq!(reached, Some(SocketAddr::from_str("10.255.255.1:0").unwrap()));
    }
}
