use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::docker::{ContainerInspect, ContainerSummary, DockerClient};
use crate::labels::{self, ProxyConfig, ProxyDefaults, StreamConfig};
use crate::mirror::MirrorHandle;
use crate::npm::models::{
    self, ProxyHostPayload, ResourceKind, StreamPayload, META_PROXY_INDEX, META_STREAM_INDEX,
};
use crate::npm::{NpmClient, NpmError};

use super::certs::CertificateMatcher;
use super::network::NetworkInspector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Proxy,
    Stream,
}

impl HandleKind {
    fn resource_kind(self) -> ResourceKind {
        match self {
            HandleKind::Proxy => ResourceKind::ProxyHost,
            HandleKind::Stream => ResourceKind::Stream,
        }
    }
}

/// Key of the only state this controller keeps across events: which remote
/// resource a `(container, kind, index)` triple currently owns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub container_id: String,
    pub kind: HandleKind,
    pub index: u8,
}

/// SHA-256 over the reserved-prefix subset of a label map, keys sorted. Two
/// events with the same hash cannot produce different remote state, so the
/// reconciler skips them wholesale.
pub fn label_hash(labels: &HashMap<String, String>) -> String {
    let mut lines: Vec<String> = labels
        .iter()
        .filter(|(k, _)| labels::is_reserved_label(k))
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn domains_overlap(a: &[String], b: &[String]) -> bool {
    a.iter().any(|da| {
        b.iter()
            .any(|db| da.eq_ignore_ascii_case(db))
    })
}

/// Diff-and-apply engine: one call per container event, strictly sequential.
/// All maps are owned here and touched only from the event task.
pub struct Reconciler {
    docker: Arc<DockerClient>,
    npm: Arc<NpmClient>,
    network: Arc<NetworkInspector>,
    certs: CertificateMatcher,
    mirror: Arc<dyn MirrorHandle>,
    instance_id: String,
    npm_url: String,
    defaults: ProxyDefaults,
    handles: HashMap<HandleKey, i64>,
    label_hashes: HashMap<String, String>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        docker: Arc<DockerClient>,
        npm: Arc<NpmClient>,
        network: Arc<NetworkInspector>,
        mirror: Arc<dyn MirrorHandle>,
        instance_id: String,
        npm_url: String,
        defaults: ProxyDefaults,
    ) -> Self {
        let certs = CertificateMatcher::new(npm.clone());
        Self {
            docker,
            npm,
            network,
            certs,
            mirror,
            instance_id,
            npm_url,
            defaults,
            handles: HashMap::new(),
            label_hashes: HashMap::new(),
        }
    }

    /// Remote id currently tracked for a `(container, kind, index)` triple.
    pub fn resource_id(&self, container_id: &str, kind: HandleKind, index: u8) -> Option<i64> {
        self.handles
            .get(&HandleKey {
                container_id: container_id.to_string(),
                kind,
                index,
            })
            .copied()
    }

    pub fn tracked_handles(&self) -> usize {
        self.handles.len()
    }

    /// Rebuilds handles after a cold start by reading the ownership meta of
    /// every remote resource. Resources of ours whose container no longer
    /// exists are deleted: no event will ever arrive for them.
    pub async fn adopt_existing(&mut self, containers: &[ContainerSummary]) -> anyhow::Result<()> {
        let present: HashSet<&str> = containers.iter().map(|c| c.id.as_str()).collect();

        let proxy_hosts = self.npm.list_proxy_hosts().await?;
        for host in proxy_hosts {
            if !models::is_ours_for_instance(&host.meta, &self.instance_id) {
                continue;
            }
            let (Some(container_id), Some(index)) = (
                models::meta_container_id(&host.meta).map(str::to_string),
                models::meta_proxy_index(&host.meta),
            ) else {
                continue;
            };
            self.adopt_one(HandleKind::Proxy, host.id, container_id, index, &present)
                .await;
        }

        let streams = self.npm.list_streams().await?;
        for stream in streams {
            if !models::is_ours_for_instance(&stream.meta, &self.instance_id) {
                continue;
            }
            let (Some(container_id), Some(index)) = (
                models::meta_container_id(&stream.meta).map(str::to_string),
                models::meta_stream_index(&stream.meta),
            ) else {
                continue;
            };
            self.adopt_one(HandleKind::Stream, stream.id, container_id, index, &present)
                .await;
        }

        info!(handles = self.handles.len(), "adopted existing resources");
        Ok(())
    }

    async fn adopt_one(
        &mut self,
        kind: HandleKind,
        remote_id: i64,
        container_id: String,
        index: u8,
        present: &HashSet<&str>,
    ) {
        if present.contains(container_id.as_str()) {
            debug!(container = container_id.as_str(), ?kind, index, remote_id, "adopted handle");
            self.handles.insert(
                HandleKey {
                    container_id,
                    kind,
                    index,
                },
                remote_id,
            );
        } else {
            info!(
                container = container_id.as_str(),
                remote_id, "deleting orphaned resource of a vanished container"
            );
            if let Err(err) = self
                .npm
                .delete_resource(kind.resource_kind(), remote_id)
                .await
            {
                error!(remote_id, "failed to delete orphaned resource: {err}");
            }
        }
    }

    /// Single entry point per container event.
    pub async fn reconcile(
        &mut self,
        container_id: &str,
        container_name: &str,
        container_labels: &HashMap<String, String>,
    ) {
        let hash = label_hash(container_labels);
        if self.label_hashes.get(container_id) == Some(&hash) {
            debug!(container = container_name, "labels unchanged, nothing to do");
            return;
        }

        let (proxies, streams) = labels::parse_labels(container_labels, &self.defaults);

        let tracked = self
            .handles
            .keys()
            .any(|k| k.container_id == container_id);
        if proxies.is_empty() && streams.is_empty() && !tracked {
            // Not ours and never was; remember the hash so the next event
            // for this container is a no-op.
            self.label_hashes.insert(container_id.to_string(), hash);
            return;
        }

        info!(
            container = container_name,
            proxies = proxies.len(),
            streams = streams.len(),
            "reconciling"
        );

        let mut inspected: Option<ContainerInspect> = None;
        let mut complete = true;

        let declared_proxies: HashSet<u8> = proxies.keys().copied().collect();
        let declared_streams: HashSet<u8> = streams.keys().copied().collect();
        complete &= self
            .remove_stale(container_id, HandleKind::Proxy, &declared_proxies)
            .await;
        complete &= self
            .remove_stale(container_id, HandleKind::Stream, &declared_streams)
            .await;

        for (index, cfg) in &proxies {
            complete &= self
                .apply_proxy(container_id, container_name, *index, cfg, &mut inspected)
                .await;
        }
        for (index, cfg) in &streams {
            complete &= self
                .apply_stream(container_id, container_name, *index, cfg, &mut inspected)
                .await;
        }

        if complete {
            self.label_hashes.insert(container_id.to_string(), hash);
        } else {
            warn!(
                container = container_name,
                "reconcile incomplete, the next event for this container retries"
            );
        }

        self.mirror.request_sync();
    }

    /// Deletes remotes for indices no longer declared. Failures keep the
    /// handle so the delete is retried on the next event.
    async fn remove_stale(
        &mut self,
        container_id: &str,
        kind: HandleKind,
        declared: &HashSet<u8>,
    ) -> bool {
        let stale: Vec<HandleKey> = self
            .handles
            .keys()
            .filter(|k| {
                k.container_id == container_id && k.kind == kind && !declared.contains(&k.index)
            })
            .cloned()
            .collect();

        let mut ok = true;
        for key in stale {
            let remote_id = self.handles[&key];
            match self
                .npm
                .delete_resource(kind.resource_kind(), remote_id)
                .await
            {
                Ok(()) => {
                    info!(
                        container = container_id,
                        index = key.index,
                        remote_id,
                        "removed {} for dropped label index",
                        kind.resource_kind()
                    );
                    self.handles.remove(&key);
                }
                Err(err) => {
                    error!(
                        container = container_id,
                        index = key.index,
                        remote_id,
                        "failed to remove stale {}: {err}",
                        kind.resource_kind()
                    );
                    ok = false;
                }
            }
        }
        ok
    }

    async fn inspect_cached<'a>(
        &self,
        container_id: &str,
        cache: &'a mut Option<ContainerInspect>,
    ) -> anyhow::Result<&'a ContainerInspect> {
        if cache.is_none() {
            *cache = Some(self.docker.inspect_container(container_id).await?);
        }
        Ok(cache.as_ref().expect("just inserted"))
    }

    async fn apply_proxy(
        &mut self,
        container_id: &str,
        container_name: &str,
        index: u8,
        cfg: &ProxyConfig,
        inspected: &mut Option<ContainerInspect>,
    ) -> bool {
        let forward_host = match &cfg.forward_host {
            Some(host) => host.clone(),
            None => {
                let inspect = match self.inspect_cached(container_id, inspected).await {
                    Ok(inspect) => inspect,
                    Err(err) => {
                        error!(container = container_name, index, "inspect failed: {err:#}");
                        return false;
                    }
                };
                match self.network.forward_host(inspect).await {
                    Ok(host) => host,
                    Err(err) => {
                        error!(container = container_name, index, "host inference failed: {err:#}");
                        return false;
                    }
                }
            }
        };

        let forward_port = match cfg.forward_port {
            Some(port) => Some(port),
            None => match self.inspect_cached(container_id, inspected).await {
                Ok(inspect) => NetworkInspector::forward_port(inspect),
                Err(err) => {
                    error!(container = container_name, index, "inspect failed: {err:#}");
                    return false;
                }
            },
        };
        let Some(forward_port) = forward_port else {
            warn!(
                container = container_name,
                index, "no forward port declared or discoverable, skipping proxy"
            );
            return true;
        };

        let mut certificate_id = cfg.certificate_id;
        if cfg.ssl_forced && certificate_id.is_none() {
            certificate_id = self.certs.find_certificate(&cfg.domains).await;
            if certificate_id.is_none() {
                warn!(
                    container = container_name,
                    index,
                    domains = ?cfg.domains,
                    "ssl requested but no certificate matches, creating without SSL"
                );
            }
        }
        let certificate_id = certificate_id.unwrap_or(0);
        // NPM rejects SSL flags on a host without a certificate.
        let with_ssl = certificate_id != 0;

        let payload = ProxyHostPayload {
            domain_names: cfg.domains.clone(),
            forward_scheme: cfg.forward_scheme.as_str().to_string(),
            forward_host,
            forward_port,
            certificate_id,
            ssl_forced: cfg.ssl_forced && with_ssl,
            hsts_enabled: cfg.hsts && with_ssl,
            hsts_subdomains: cfg.hsts_subdomains && with_ssl,
            http2_support: cfg.http2 && with_ssl,
            block_exploits: cfg.block_exploits,
            caching_enabled: cfg.caching_enabled,
            allow_websocket_upgrade: cfg.websocket_upgrade,
            access_list_id: cfg.access_list_id.unwrap_or(0),
            advanced_config: cfg.advanced_config.clone(),
            enabled: true,
            locations: Vec::new(),
            meta: models::owned_meta(
                &self.instance_id,
                &self.npm_url,
                container_id,
                META_PROXY_INDEX,
                index,
            ),
        };

        self.create_or_replace_proxy(container_id, container_name, index, cfg, payload)
            .await
    }

    async fn create_or_replace_proxy(
        &mut self,
        container_id: &str,
        container_name: &str,
        index: u8,
        cfg: &ProxyConfig,
        payload: ProxyHostPayload,
    ) -> bool {
        let key = HandleKey {
            container_id: container_id.to_string(),
            kind: HandleKind::Proxy,
            index,
        };

        if let Some(&existing) = self.handles.get(&key) {
            // NPM edits are unreliable across field combinations; recreate is
            // always safe for a resource we own.
            if let Err(err) = self.npm.delete_resource(ResourceKind::ProxyHost, existing).await {
                error!(
                    container = container_name,
                    index, existing, "failed to delete proxy host before recreate: {err}"
                );
                return false;
            }
            self.handles.remove(&key);
        } else {
            let hosts = match self.npm.list_proxy_hosts().await {
                Ok(hosts) => hosts,
                Err(err) => {
                    error!(container = container_name, index, "failed to list proxy hosts: {err}");
                    return false;
                }
            };
            if let Some(existing) = hosts
                .iter()
                .find(|h| domains_overlap(&h.domain_names, &cfg.domains))
            {
                if models::is_ours_for_instance(&existing.meta, &self.instance_id) {
                    if let Err(err) = self
                        .npm
                        .delete_resource(ResourceKind::ProxyHost, existing.id)
                        .await
                    {
                        error!(
                            container = container_name,
                            index, "failed to replace our existing proxy host: {err}"
                        );
                        return false;
                    }
                } else {
                    let owner = models::meta_instance_id(&existing.meta)
                        .unwrap_or("manually created");
                    error!(
                        container = container_name,
                        index,
                        domains = ?cfg.domains,
                        remote_id = existing.id,
                        owner,
                        "proxy host for these domains belongs to someone else, refusing to touch it"
                    );
                    return false;
                }
            }
        }

        match self.npm.create_proxy_host(&payload).await {
            Ok(remote_id) => {
                info!(
                    container = container_name,
                    index,
                    remote_id,
                    domains = ?cfg.domains,
                    forward = %format!("{}://{}:{}", payload.forward_scheme, payload.forward_host, payload.forward_port),
                    "proxy host created"
                );
                self.handles.insert(key, remote_id);
                true
            }
            Err(NpmError::Conflict { detail }) => {
                error!(
                    container = container_name,
                    index,
                    domains = ?cfg.domains,
                    "NPM rejected the proxy host as a duplicate ({detail}); remove the conflicting host or change the labels"
                );
                false
            }
            Err(err) => {
                error!(container = container_name, index, "failed to create proxy host: {err}");
                false
            }
        }
    }

    async fn apply_stream(
        &mut self,
        container_id: &str,
        container_name: &str,
        index: u8,
        cfg: &StreamConfig,
        inspected: &mut Option<ContainerInspect>,
    ) -> bool {
        let forwarding_host = match &cfg.forward_host {
            Some(host) => host.clone(),
            None => {
                let inspect = match self.inspect_cached(container_id, inspected).await {
                    Ok(inspect) => inspect,
                    Err(err) => {
                        error!(container = container_name, index, "inspect failed: {err:#}");
                        return false;
                    }
                };
                match self.network.forward_host(inspect).await {
                    Ok(host) => host,
                    Err(err) => {
                        error!(container = container_name, index, "host inference failed: {err:#}");
                        return false;
                    }
                }
            }
        };

        let forwarding_port = match cfg.forward_port {
            Some(port) => Some(port),
            None => match self.inspect_cached(container_id, inspected).await {
                Ok(inspect) => NetworkInspector::forward_port(inspect),
                Err(err) => {
                    error!(container = container_name, index, "inspect failed: {err:#}");
                    return false;
                }
            },
        };
        let Some(forwarding_port) = forwarding_port else {
            warn!(
                container = container_name,
                index, "no forward port declared or discoverable, skipping stream"
            );
            return true;
        };

        let certificate_id = match &cfg.ssl_certificate {
            None => 0,
            Some(raw) => match raw.parse::<i64>() {
                Ok(id) => id,
                Err(_) => {
                    let domains = vec![raw.clone()];
                    match self.certs.find_certificate(&domains).await {
                        Some(id) => id,
                        None => {
                            warn!(
                                container = container_name,
                                index,
                                domain = raw.as_str(),
                                "no certificate matches the stream ssl label, creating without SSL"
                            );
                            0
                        }
                    }
                }
            },
        };

        let payload = StreamPayload {
            incoming_port: cfg.incoming_port,
            forwarding_host,
            forwarding_port,
            tcp_forwarding: cfg.tcp_forwarding,
            udp_forwarding: cfg.udp_forwarding,
            certificate_id,
            enabled: true,
            meta: models::owned_meta(
                &self.instance_id,
                &self.npm_url,
                container_id,
                META_STREAM_INDEX,
                index,
            ),
        };

        self.create_or_replace_stream(container_id, container_name, index, cfg, payload)
            .await
    }

    async fn create_or_replace_stream(
        &mut self,
        container_id: &str,
        container_name: &str,
        index: u8,
        cfg: &StreamConfig,
        payload: StreamPayload,
    ) -> bool {
        let key = HandleKey {
            container_id: container_id.to_string(),
            kind: HandleKind::Stream,
            index,
        };

        if let Some(&existing) = self.handles.get(&key) {
            if let Err(err) = self.npm.delete_resource(ResourceKind::Stream, existing).await {
                error!(
                    container = container_name,
                    index, existing, "failed to delete stream before recreate: {err}"
                );
                return false;
            }
            self.handles.remove(&key);
        } else {
            let streams = match self.npm.list_streams().await {
                Ok(streams) => streams,
                Err(err) => {
                    error!(container = container_name, index, "failed to list streams: {err}");
                    return false;
                }
            };
            if let Some(existing) = streams
                .iter()
                .find(|s| s.incoming_port == cfg.incoming_port)
            {
                if models::is_ours_for_instance(&existing.meta, &self.instance_id) {
                    if let Err(err) = self
                        .npm
                        .delete_resource(ResourceKind::Stream, existing.id)
                        .await
                    {
                        error!(
                            container = container_name,
                            index, "failed to replace our existing stream: {err}"
                        );
                        return false;
                    }
                } else {
                    let owner = models::meta_instance_id(&existing.meta)
                        .unwrap_or("manually created");
                    error!(
                        container = container_name,
                        index,
                        incoming_port = cfg.incoming_port,
                        remote_id = existing.id,
                        owner,
                        "stream on this port belongs to someone else, refusing to touch it"
                    );
                    return false;
                }
            }
        }

        match self.npm.create_stream(&payload).await {
            Ok(remote_id) => {
                info!(
                    container = container_name,
                    index,
                    remote_id,
                    incoming_port = cfg.incoming_port,
                    "stream created"
                );
                self.handles.insert(key, remote_id);
                true
            }
            Err(NpmError::Conflict { detail }) => {
                error!(
                    container = container_name,
                    index,
                    incoming_port = cfg.incoming_port,
                    "NPM rejected the stream as a duplicate ({detail}); free the port or change the labels"
                );
                false
            }
            Err(err) => {
                error!(container = container_name, index, "failed to create stream: {err}");
                false
            }
        }
    }

    /// Container stopped or vanished: tear down everything it owned. Handles
    /// are dropped even when a delete fails, otherwise a restarted NPM whose
    /// ids no longer exist would leak handles forever; the meta ledger on
    /// the NPM side still allows cleanup on the next cold start.
    pub async fn container_gone(&mut self, container_id: &str) {
        let keys: Vec<HandleKey> = self
            .handles
            .keys()
            .filter(|k| k.container_id == container_id)
            .cloned()
            .collect();

        let had_hash = self.label_hashes.remove(container_id).is_some();
        if keys.is_empty() {
            if had_hash {
                debug!(container = container_id, "container gone, nothing tracked");
            }
            return;
        }

        info!(
            container = container_id,
            resources = keys.len(),
            "container gone, removing its resources"
        );
        for key in keys {
            let remote_id = self.handles.remove(&key).expect("key taken from map");
            if let Err(err) = self
                .npm
                .delete_resource(key.kind.resource_kind(), remote_id)
                .await
            {
                error!(
                    container = container_id,
                    index = key.index,
                    remote_id,
                    "failed to delete {} of removed container (handle dropped): {err}",
                    key.kind.resource_kind()
                );
            }
        }

        self.mirror.request_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn hash_covers_only_reserved_labels() {
        let a = labels_of(&[("npm.proxy.domains", "a.test"), ("other", "1")]);
        let b = labels_of(&[("npm.proxy.domains", "a.test"), ("other", "2")]);
        assert_eq!(label_hash(&a), label_hash(&b));

        let c = labels_of(&[("npm.proxy.domains", "b.test"), ("other", "1")]);
        assert_ne!(label_hash(&a), label_hash(&c));
    }

    #[test]
    fn hash_is_order_independent() {
        let a = labels_of(&[("npm.proxy.domains", "a"), ("npm.proxy.port", "80")]);
        let b = labels_of(&[("npm.proxy.port", "80"), ("npm.proxy.domains", "a")]);
        assert_eq!(label_hash(&a), label_hash(&b));
    }

    #[test]
    fn dash_and_dot_prefixes_both_hash() {
        let a = labels_of(&[("npm-proxy-domains", "a")]);
        let b = labels_of(&[]);
        assert_ne!(label_hash(&a), label_hash(&b));
    }

    #[test]
    fn overlap_is_case_insensitive() {
        let ours = vec!["E.Test".to_string()];
        let theirs = vec!["x.test".to_string(), "e.test".to_string()];
        assert!(domains_overlap(&ours, &theirs));
        assert!(!domains_overlap(&["a.test".to_string()], &["b.test".to_string()]));
    }
}
