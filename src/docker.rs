use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin client for the Docker Engine REST API. The endpoint is an HTTP(S)
/// base URL; `tcp://` is accepted as a synonym for `http://`.
#[derive(Clone)]
pub struct DockerClient {
    client: reqwest::Client,
    base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names", default)]
    pub names: Vec<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "State", default)]
    pub state: String,
}

impl ContainerSummary {
    /// Docker reports names with a leading slash.
    pub fn primary_name(&self) -> &str {
        self.names
            .first()
            .map(|n| n.trim_start_matches('/'))
            .unwrap_or(&self.id)
    }

    pub fn matches(&self, name_or_id_prefix: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.trim_start_matches('/') == name_or_id_prefix)
            || self.id.starts_with(name_or_id_prefix)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerInspect {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Config", default)]
    pub config: InspectConfig,
    #[serde(rename = "NetworkSettings", default)]
    pub network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectConfig {
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "ExposedPorts", default)]
    pub exposed_ports: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSettings {
    #[serde(rename = "Networks", default)]
    pub networks: HashMap<String, serde_json::Value>,
    #[serde(rename = "Ports", default)]
    pub ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostPort", default)]
    pub host_port: String,
}

impl ContainerInspect {
    pub fn container_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    pub fn network_names(&self) -> impl Iterator<Item = &str> {
        self.network_settings.networks.keys().map(String::as_str)
    }

    /// Candidate forward ports in preference order: published ports before
    /// merely exposed ones, numerically ascending within each class.
    pub fn candidate_ports(&self) -> Vec<u16> {
        fn port_of(spec: &str) -> Option<u16> {
            spec.split('/').next()?.parse().ok()
        }

        let mut published: Vec<u16> = Vec::new();
        let mut exposed: Vec<u16> = Vec::new();

        for (spec, bindings) in &self.network_settings.ports {
            let Some(port) = port_of(spec) else { continue };
            match bindings {
                Some(b) if !b.is_empty() => published.push(port),
                _ => exposed.push(port),
            }
        }
        for spec in self.config.exposed_ports.keys() {
            if let Some(port) = port_of(spec) {
                if !self.network_settings.ports.contains_key(spec) {
                    exposed.push(port);
                }
            }
        }

        published.sort_unstable();
        published.dedup();
        exposed.sort_unstable();
        exposed.dedup();
        exposed.retain(|p| !published.contains(p));

        published.extend(exposed);
        published
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInfo {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "IPAM", default)]
    pub ipam: Ipam,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Ipam {
    #[serde(rename = "Config", default)]
    pub config: Vec<IpamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpamConfig {
    #[serde(rename = "Gateway")]
    pub gateway: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerEvent {
    #[serde(rename = "Type", default)]
    pub event_type: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

impl DockerClient {
    pub fn new(endpoint: &str) -> Result<Self> {
        let base = endpoint
            .trim()
            .trim_end_matches('/')
            .replace("tcp://", "http://");
        if !base.starts_with("http://") && !base.starts_with("https://") {
            anyhow::bail!("unsupported Docker endpoint {endpoint:?}, expected http(s):// or tcp://");
        }

        // No client-wide timeout: the event stream must stay open
        // indefinitely. Bounded calls set a per-request timeout instead.
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create Docker HTTP client")?;

        Ok(Self { client, base })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .get(format!("{}/_ping", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("Docker host {} is unreachable", self.base))?;
        Ok(())
    }

    /// Lists containers, stopped ones included.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let response = self
            .client
            .get(format!("{}/containers/json", self.base))
            .query(&[("all", "true")])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn inspect_container(&self, id: &str) -> Result<ContainerInspect> {
        let response = self
            .client
            .get(format!("{}/containers/{id}/json", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to inspect container {id}"))?;
        Ok(response.json().await?)
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkInfo>> {
        let response = self
            .client
            .get(format!("{}/networks", self.base))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Opens the long-lived container event stream. The endpoint emits one
    /// JSON document per line, so frames are split on newlines rather than
    /// decoded as SSE.
    pub async fn events(&self) -> Result<EventStream> {
        let filters = serde_json::json!({ "type": ["container"] }).to_string();
        let response = self
            .client
            .get(format!("{}/events", self.base))
            .query(&[("filters", filters.as_str())])
            .send()
            .await?
            .error_for_status()
            .context("failed to subscribe to Docker events")?;

        Ok(EventStream {
            inner: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
        })
    }
}

pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
}

impl EventStream {
    /// Next container event; `None` when the daemon closes the stream.
    /// Unparseable lines are skipped with a warning so one odd event cannot
    /// wedge the loop.
    pub async fn next(&mut self) -> Option<Result<ContainerEvent>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<ContainerEvent>(line) {
                    Ok(event) => return Some(Ok(event)),
                    Err(err) => {
                        warn!(error = %err, "skipping unparseable Docker event");
                        continue;
                    }
                }
            }

            match self.inner.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(err)) => return Some(Err(err.into())),
                None => return None,
            }
        }
    }
}
