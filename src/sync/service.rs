use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{signal, time::sleep};
use tracing::{debug, error, info, warn};

use crate::docker::{ContainerEvent, DockerClient};
use crate::labels;

use super::network::NetworkInspector;
use super::reconciler::Reconciler;

/// Drives the control loop: initial adoption and full scan, then the Docker
/// event stream, one event at a time. Sequential handling is what keeps the
/// reconciler free of per-container locks.
pub struct SyncService {
    docker: Arc<DockerClient>,
    network: Arc<NetworkInspector>,
    reconciler: Reconciler,
    max_retries: u32,
}

impl SyncService {
    pub fn new(
        docker: Arc<DockerClient>,
        network: Arc<NetworkInspector>,
        reconciler: Reconciler,
        max_retries: u32,
    ) -> Self {
        Self {
            docker,
            network,
            reconciler,
            max_retries,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.network.init().await;

        tokio::select! {
            result = self.event_loop() => {
                error!("event loop terminated: {result:?}");
                result
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                Ok(())
            }
        }
    }

    async fn event_loop(&mut self) -> Result<()> {
        let mut retry_count: u32 = 0;

        loop {
            match self.watch_events().await {
                Ok(()) => {
                    warn!("event stream closed by the daemon, resubscribing");
                    retry_count = 0;
                }
                Err(err) => {
                    retry_count += 1;
                    let backoff = std::cmp::min(300, 2_u64.pow(retry_count.min(8)));
                    error!(attempt = retry_count, "event stream failed: {err:#}");
                    if retry_count > self.max_retries {
                        return Err(err).context("max retries exceeded");
                    }
                    sleep(std::time::Duration::from_secs(backoff)).await;
                }
            }
        }
    }

    /// Subscribes first, scans second: anything that changes between the
    /// scan and the first event is still delivered on the stream.
    async fn watch_events(&mut self) -> Result<()> {
        let mut events = self.docker.events().await?;
        info!("subscribed to Docker container events");

        self.initial_scan().await;

        while let Some(event) = events.next().await {
            self.handle_event(event?).await;
        }
        Ok(())
    }

    /// Rebuilds handles from the NPM-side ownership meta, then reconciles
    /// every container carrying reserved labels (stopped ones included, so
    /// stale state for them is cleaned up too).
    async fn initial_scan(&mut self) {
        let containers = match self.docker.list_containers().await {
            Ok(containers) => containers,
            Err(err) => {
                error!("initial container scan failed: {err:#}");
                return;
            }
        };

        if let Err(err) = self.reconciler.adopt_existing(&containers).await {
            error!("failed to adopt existing NPM resources: {err:#}");
        }

        let mut scanned = 0usize;
        for container in &containers {
            if container.labels.keys().any(|k| labels::is_reserved_label(k)) {
                self.reconciler
                    .reconcile(&container.id, container.primary_name(), &container.labels)
                    .await;
                scanned += 1;
            }
        }
        info!(labelled = scanned, total = containers.len(), "initial scan complete");
    }

    async fn handle_event(&mut self, event: ContainerEvent) {
        match event.action.as_str() {
            "start" | "update" => {
                let container_id = event.actor.id.as_str();
                match self.docker.inspect_container(container_id).await {
                    Ok(inspect) => {
                        let name = inspect.container_name().to_string();
                        self.reconciler
                            .reconcile(&inspect.id, &name, &inspect.config.labels)
                            .await;
                    }
                    Err(err) => {
                        error!(
                            container = container_id,
                            action = event.action.as_str(),
                            "failed to inspect container for event: {err:#}"
                        );
                    }
                }
            }
            "stop" | "die" | "destroy" => {
                self.reconciler.container_gone(&event.actor.id).await;
            }
            other => debug!(action = other, "ignoring container event"),
        }
    }
}
