use clap::Parser;

use crate::labels::{parse_bool, ProxyDefaults};

fn flexible_bool(raw: &str) -> Result<bool, String> {
    Ok(parse_bool(raw))
}

/// Everything scalar is a flag and an environment variable; mirror slots
/// are numbered variables and parsed separately (see [`crate::mirror`]).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "npmsync",
    about = "Reconciles Docker container labels into Nginx Proxy Manager",
    version
)]
pub struct Config {
    /// Base URL of the primary Nginx Proxy Manager instance
    #[arg(long, env = "NPM_URL")]
    pub npm_url: String,

    /// Admin email for the NPM API
    #[arg(long, env = "NPM_EMAIL")]
    pub npm_email: String,

    /// Admin password for the NPM API
    #[arg(long, env = "NPM_PASSWORD", hide_env_values = true)]
    pub npm_password: String,

    /// Docker Engine API endpoint (http://, https:// or tcp://)
    #[arg(long, env = "DOCKER_HOST", default_value = "http://localhost:2375")]
    pub docker_host: String,

    /// Stable identifier for this controller instance (defaults to the
    /// hostname)
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Name or id prefix of the container running NPM; enables
    /// shared-network forward-host inference
    #[arg(long, env = "NPM_CONTAINER_NAME")]
    pub npm_container_name: Option<String>,

    /// Address NPM should use for containers it shares no network with
    #[arg(long, env = "HOST_ADDRESS")]
    pub host_address: Option<String>,

    /// Health check server port
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Maximum consecutive event-stream failures before giving up
    #[arg(long, env = "MAX_RETRIES", default_value = "5")]
    pub max_retries: u32,

    /// Default for `npm.proxy.*.ssl.force`
    #[arg(long, env = "SSL_FORCED_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub ssl_forced_default: bool,

    /// Default for `npm.proxy.*.caching`
    #[arg(long, env = "CACHING_ENABLED_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub caching_enabled_default: bool,

    /// Default for `npm.proxy.*.block_common_exploits`
    #[arg(long, env = "BLOCK_EXPLOITS_DEFAULT", default_value = "true", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub block_exploits_default: bool,

    /// Default for `npm.proxy.*.websockets`
    #[arg(long, env = "WEBSOCKET_UPGRADE_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub websocket_upgrade_default: bool,

    /// Default for `npm.proxy.*.ssl.http2`
    #[arg(long, env = "HTTP2_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub http2_default: bool,

    /// Default for `npm.proxy.*.ssl.hsts`
    #[arg(long, env = "HSTS_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub hsts_default: bool,

    /// Default for `npm.proxy.*.ssl.hsts.subdomains`
    #[arg(long, env = "HSTS_SUBDOMAINS_DEFAULT", default_value = "false", value_parser = flexible_bool, action = clap::ArgAction::Set)]
    pub hsts_subdomains_default: bool,
}

impl Config {
    pub fn proxy_defaults(&self) -> ProxyDefaults {
        ProxyDefaults {
            ssl_forced: self.ssl_forced_default,
            caching_enabled: self.caching_enabled_default,
            block_exploits: self.block_exploits_default,
            websocket_upgrade: self.websocket_upgrade_default,
            http2: self.http2_default,
            hsts: self.hsts_default,
            hsts_subdomains: self.hsts_subdomains_default,
        }
    }
}
