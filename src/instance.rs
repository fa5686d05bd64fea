use tracing::{debug, warn};

/// Resolves the stable identifier this process writes into
/// `meta.sync_instance_id`. Resolution order: configured override, the
/// `HOSTNAME` environment variable, `/etc/hostname` (inside a container this
/// is the container id), then a literal fallback.
///
/// The id must survive restarts: ownership arbitration compares it against
/// the `sync_instance_id` already stored on remote resources.
pub fn resolve_instance_id(configured: Option<&str>) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        debug!(instance_id = id, "using configured instance id");
        return id.to_string();
    }

    if let Ok(hostname) = std::env::var("HOSTNAME") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
        let hostname = hostname.trim();
        if !hostname.is_empty() {
            return hostname.to_string();
        }
    }

    warn!("no hostname available, instance id falls back to \"default\"");
    "default".to_string()
}
