use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::docker::{ContainerInspect, DockerClient};

const TOPOLOGY_TTL: Duration = Duration::from_secs(10 * 60);

/// Special hostname Docker resolves to the host from inside containers.
const HOST_GATEWAY: &str = "host.docker.internal";

#[derive(Debug, Clone)]
struct Topology {
    proxy_nets: HashSet<String>,
    host_address: String,
    refreshed: Instant,
}

/// Answers "what address should NPM forward to for this container". If the
/// container shares a network with the NPM container, NPM reaches it by
/// container DNS name; otherwise traffic has to go via a host address.
pub struct NetworkInspector {
    docker: Arc<DockerClient>,
    npm_container: Option<String>,
    host_override: Option<String>,
    state: Mutex<Option<Topology>>,
}

impl NetworkInspector {
    pub fn new(
        docker: Arc<DockerClient>,
        npm_container: Option<String>,
        host_override: Option<String>,
    ) -> Self {
        Self {
            docker,
            npm_container,
            host_override,
            state: Mutex::new(None),
        }
    }

    /// Eagerly discovers the topology so startup logs show what inference
    /// will do. Failures are not fatal; discovery retries lazily.
    pub async fn init(&self) {
        if let Err(err) = self.topology().await {
            warn!("network topology discovery failed, will retry: {err:#}");
        }
    }

    async fn topology(&self) -> Result<Topology> {
        let mut guard = self.state.lock().await;
        if let Some(topology) = guard.as_ref() {
            if topology.refreshed.elapsed() < TOPOLOGY_TTL {
                return Ok(topology.clone());
            }
        }

        let topology = self.discover().await?;
        *guard = Some(topology.clone());
        Ok(topology)
    }

    async fn discover(&self) -> Result<Topology> {
        let proxy_nets = match &self.npm_container {
            None => HashSet::new(),
            Some(name) => {
                let containers = self.docker.list_containers().await?;
                match containers.iter().find(|c| c.matches(name)) {
                    None => {
                        warn!(
                            container = name.as_str(),
                            "proxy-manager container not found, shared-network inference disabled"
                        );
                        HashSet::new()
                    }
                    Some(found) => {
                        let inspect = self.docker.inspect_container(&found.id).await?;
                        inspect.network_names().map(str::to_string).collect()
                    }
                }
            }
        };

        let host_address = self.discover_host_address().await;
        info!(
            host_address = host_address.as_str(),
            proxy_networks = ?proxy_nets,
            "network topology resolved"
        );

        Ok(Topology {
            proxy_nets,
            host_address,
            refreshed: Instant::now(),
        })
    }

    async fn discover_host_address(&self) -> String {
        if let Some(address) = self
            .host_override
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
        {
            return address.to_string();
        }

        if tokio::net::lookup_host((HOST_GATEWAY, 80)).await.is_ok() {
            debug!("{HOST_GATEWAY} resolves, using it as the host address");
            return HOST_GATEWAY.to_string();
        }

        match self.docker.list_networks().await {
            Ok(networks) => {
                let gateway = networks
                    .iter()
                    .find(|n| n.name == "bridge")
                    .and_then(|n| {
                        n.ipam
                            .config
                            .iter()
                            .filter_map(|c| c.gateway.as_deref())
                            .find(|g| g.parse::<Ipv4Addr>().is_ok())
                    });
                if let Some(gateway) = gateway {
                    return gateway.to_string();
                }
            }
            Err(err) => warn!("failed to list networks for gateway discovery: {err:#}"),
        }

        warn!("no host address discoverable, falling back to {HOST_GATEWAY}");
        HOST_GATEWAY.to_string()
    }

    /// Default forward host for a container (labels supplying an explicit
    /// host never reach this).
    pub async fn forward_host(&self, inspect: &ContainerInspect) -> Result<String> {
        let topology = self.topology().await?;
        let networks: HashSet<&str> = inspect.network_names().collect();
        Ok(choose_forward_host(
            inspect.container_name(),
            &networks,
            &topology.proxy_nets,
            &topology.host_address,
        ))
    }

    /// Default forward port: the container's first candidate port.
    pub fn forward_port(inspect: &ContainerInspect) -> Option<u16> {
        inspect.candidate_ports().first().copied()
    }
}

fn choose_forward_host(
    container_name: &str,
    container_nets: &HashSet<&str>,
    proxy_nets: &HashSet<String>,
    host_address: &str,
) -> String {
    if container_nets
        .iter()
        .any(|net| proxy_nets.contains(*net))
    {
        container_name.to_string()
    } else {
        host_address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nets(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn shared_network_uses_container_dns_name() {
        let container: HashSet<&str> = ["proxynet", "other"].into_iter().collect();
        let host = choose_forward_host("echo", &container, &nets(&["proxynet"]), "172.17.0.1");
        assert_eq!(host, "echo");
    }

    #[test]
    fn disjoint_networks_use_host_address() {
        let container: HashSet<&str> = ["appnet"].into_iter().collect();
        let host = choose_forward_host("ext", &container, &nets(&["proxynet"]), "172.17.0.1");
        assert_eq!(host, "172.17.0.1");
    }

    #[test]
    fn empty_proxy_nets_always_use_host_address() {
        let container: HashSet<&str> = ["bridge"].into_iter().collect();
        let host = choose_forward_host("web", &container, &nets(&[]), "host.docker.internal");
        assert_eq!(host, "host.docker.internal");
    }
}
