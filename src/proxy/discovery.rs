use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::{Lazy, OnceCell};
use pingora::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use pingora_load_balancing::{discovery::ServiceDiscovery, Backend};
use regex::Regex;

use crate::config::{Service, UpstreamScheme};

static GLOBAL_RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

static HOST_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[(.+?)\]|([^:]+))(?::(\d+))?$").expect("Invalid regex pattern for nodes")
});

fn get_global_resolver() -> Result<Arc<TokioAsyncResolver>> {
    GLOBAL_RESOLVER
        .get_or_try_init(|| TokioAsyncResolver::tokio_from_system_conf().map(Arc::new))
        .cloned()
        .or_err(InternalError, "Unable to build DNS resolver from system conf")
}

/// Builds a backend carrying the peer used to reach it.
fn build_backend(addr: &str, weight: u32, tls: bool, sni: &str) -> Result<Backend> {
    let mut backend = Backend::new(addr)?;
    backend.weight = weight as usize;
    let peer = HttpPeer::new(addr, tls, sni.to_string());
    backend.ext.insert::<HttpPeer>(peer);
    Ok(backend)
}

/// A node given by hostname, re-resolved on every discovery round.
struct DnsNode {
    name: String,
    port: u16,
    weight: u32,
}

/// Static and DNS backed node discovery for one upstream service.
pub struct NodeDiscovery {
    service_id: String,
    tls: bool,
    sni: Option<String>,
    static_backends: BTreeSet<Backend>,
    dns_nodes: Vec<DnsNode>,
}

impl NodeDiscovery {
    async fn resolve(&self, node: &DnsNode) -> Result<BTreeSet<Backend>> {
        let resolver = get_global_resolver()?;
        let sni = self.sni.as_deref().unwrap_or(&node.name);
        resolver
            .lookup_ip(node.name.as_str())
            .await
            .or_err_with(InternalError, || {
                format!("Dns discovery failed for domain {}", node.name)
            })?
            .iter()
            .map(|ip| {
                let addr = SocketAddr::new(ip, node.port).to_string();
                build_backend(&addr, node.weight, self.tls, sni)
            })
            .collect()
    }
}

#[async_trait]
impl ServiceDiscovery for NodeDiscovery {
    async fn discover(&self) -> Result<(BTreeSet<Backend>, HashMap<u64, bool>)> {
        let mut backends = self.static_backends.clone();

        let lookups = self.dns_nodes.iter().map(|node| async move {
            self.resolve(node).await.map_err(|e| {
                log::warn!(
                    "DNS discovery for '{}' of service '{}' failed: {}",
                    node.name,
                    self.service_id,
                    e
                );
                e
            })
        });

        for resolved in join_all(lookups).await.into_iter().flatten() {
            backends.extend(resolved);
        }

        log::debug!(
            "service '{}' discovered {} backends",
            self.service_id,
            backends.len()
        );
        Ok((backends, HashMap::new()))
    }
}

impl TryFrom<&Service> for NodeDiscovery {
    type Error = Box<Error>;

    fn try_from(service: &Service) -> Result<Self> {
        let tls = service.scheme == UpstreamScheme::HTTPS;
        let mut this = Self {
            service_id: service.id.clone(),
            tls,
            sni: service.host.clone(),
            static_backends: BTreeSet::new(),
            dns_nodes: Vec::new(),
        };

        for (addr, weight) in service.nodes.iter() {
            let (host, port) = parse_host_and_port(addr)?;
            let port = port.unwrap_or(if tls { 443 } else { 80 });

            match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
                Ok(ip) => {
                    let addr = SocketAddr::new(ip, port).to_string();
                    let sni = service.host.as_deref().unwrap_or_default();
                    this.static_backends
                        .insert(build_backend(&addr, *weight, tls, sni)?);
                }
                Err(_) => this.dns_nodes.push(DnsNode {
                    name: host,
                    port,
                    weight: *weight,
                }),
            }
        }

        Ok(this)
    }
}

/// Parses a host and port from a string.
fn parse_host_and_port(addr: &str) -> Result<(String, Option<u16>)> {
    let caps = match HOST_PORT_REGEX.captures(addr) {
        Some(caps) => caps,
        None => return Err(Error::explain(InternalError, "Invalid address format")),
    };

    let host = match caps.get(1).or(caps.get(2)) {
        Some(host) => host.as_str(),
        None => return Err(Error::explain(InternalError, "Missing host")),
    };
    let port = caps
        .get(3)
        .map(|p| p.as_str().parse::<u16>())
        .transpose()
        .or_err_with(InternalError, || "Invalid port")?;

    // Ensure IPv6 addresses are enclosed in square brackets
    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upstream_node() {
        let test_cases = [
            ("127.0.0.1", ("127.0.0.1".to_string(), None)),
            ("[::1]", ("[::1]".to_string(), None)),
            ("users.internal", ("users.internal".to_string(), None)),
            ("users.internal:9001", ("users.internal".to_string(), Some(9001))),
            (
                "[2001:db8:85a3::8a2e:370:7334]:8080",
                ("[2001:db8:85a3::8a2e:370:7334]".to_string(), Some(8080)),
            ),
        ];

        for (input, expected) in test_cases {
            let result = parse_host_and_port(input).unwrap();
            assert_eq!(result, expected);
        }

        assert!(parse_host_and_port("").is_err());
        assert!(parse_host_and_port("127.0.0.1:99999").is_err());
        assert!(parse_host_and_port("127.0.0.1:invalid").is_err());
    }

    #[test]
    fn test_split_static_and_dns_nodes() {
        let service: Service = serde_yaml::from_str(
            r#"
id: users
nodes:
  "127.0.0.1:9001": 2
  "[::1]:9002": 1
  "users.internal": 1
operations:
  get_user:
    path: /users/{id}
"#,
        )
        .unwrap();

        let discovery = NodeDiscovery::try_from(&service).unwrap();
        assert_eq!(discovery.static_backends.len(), 2);
        assert_eq!(discovery.dns_nodes.len(), 1);
        assert_eq!(discovery.dns_nodes[0].name, "users.internal");
        assert_eq!(discovery.dns_nodes[0].port, 80);
        assert!(discovery
            .static_backends
            .iter()
            .all(|b| b.ext.get::<HttpPeer>().is_some()));
    }
}
