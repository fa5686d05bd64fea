use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use npmsync::config::Config;
use npmsync::docker::DockerClient;
use npmsync::instance::resolve_instance_id;
use npmsync::npm::{normalize_url, NpmClient};
use npmsync::mirror;
use npmsync::sync::{NetworkInspector, Reconciler, SyncService};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    info!("npmsync v{} starting", env!("CARGO_PKG_VERSION"));

    let npm_url = normalize_url(&config.npm_url).context("invalid NPM URL")?;
    let instance_id = resolve_instance_id(config.instance_id.as_deref());
    info!(
        npm_url = npm_url.as_str(),
        instance_id = instance_id.as_str(),
        docker_host = config.docker_host.as_str(),
        "configuration resolved"
    );

    let docker = Arc::new(DockerClient::new(&config.docker_host)?);
    // Bootstrap check: an unreachable Docker host is a fatal misconfiguration.
    docker.ping().await?;

    let npm = Arc::new(NpmClient::new(
        npm_url.clone(),
        config.npm_email.clone(),
        config.npm_password.clone(),
    )?);

    tokio::spawn(run_health_server(config.health_port));

    let (mirror_targets, mirror_interval) = mirror::mirror_targets_from_env(std::env::vars());
    let mirror_handle = mirror::start(npm.clone(), mirror_targets, mirror_interval)?;

    let network = Arc::new(NetworkInspector::new(
        docker.clone(),
        config.npm_container_name.clone(),
        config.host_address.clone(),
    ));
    let reconciler = Reconciler::new(
        docker.clone(),
        npm,
        network.clone(),
        mirror_handle,
        instance_id,
        npm_url,
        config.proxy_defaults(),
    );

    let service = SyncService::new(docker, network, reconciler, config.max_retries);
    service.run().await
}

async fn run_health_server(port: u16) {
    use warp::Filter;

    let health = warp::path("health").map(|| "OK");
    let ready = warp::path("ready").map(|| "OK");

    warp::serve(health.or(ready)).run(([0, 0, 0, 0], port)).await;
}
