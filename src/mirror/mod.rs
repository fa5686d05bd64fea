pub mod resources;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::npm::{normalize_url, NpmClient};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 5 * 60;
const MIN_SYNC_INTERVAL_SECS: u64 = 60;

/// The reconciler pokes this after every change. When no mirrors are
/// configured the inactive implementation makes the call a no-op, so the
/// reconciler never has to care whether mirroring is on.
pub trait MirrorHandle: Send + Sync {
    fn request_sync(&self);
}

pub struct InactiveMirror;

impl MirrorHandle for InactiveMirror {
    fn request_sync(&self) {}
}

struct ActiveMirror {
    notify: Arc<Notify>,
}

impl MirrorHandle for ActiveMirror {
    fn request_sync(&self) {
        // Notify stores at most one permit, so a burst of requests within
        // one interval collapses into a single sync.
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub url: String,
    pub email: String,
    pub password: String,
}

/// Parses mirror targets from environment variables.
///
/// Numbered slots `MIRROR{n}_URL/_EMAIL/_PASSWORD/_SYNC_INTERVAL` are read
/// in slot order, with `MIRROR_EMAIL`/`MIRROR_PASSWORD` as credential
/// fallbacks. The legacy form is a comma-separated `MIRROR_URLS` whose
/// per-host credentials come from `MIRROR_<HOST>_EMAIL/_PASSWORD`, `<HOST>`
/// being the uppercased hostname with non-alphanumerics mapped to `_`.
/// Intervals are seconds; the effective interval is the minimum of all of
/// them and the 5-minute default, clamped to one minute.
pub fn mirror_targets_from_env(
    vars: impl IntoIterator<Item = (String, String)>,
) -> (Vec<MirrorTarget>, Duration) {
    let env: HashMap<String, String> = vars.into_iter().collect();
    let mut targets: Vec<MirrorTarget> = Vec::new();
    let mut interval_secs = DEFAULT_SYNC_INTERVAL_SECS;

    let mut note_interval = |raw: Option<&String>, source: &str| {
        if let Some(raw) = raw {
            match raw.trim().parse::<u64>() {
                Ok(secs) => interval_secs = interval_secs.min(secs),
                Err(_) => warn!(source, value = raw.as_str(), "unparseable sync interval, ignoring"),
            }
        }
    };
    note_interval(env.get("MIRROR_SYNC_INTERVAL"), "MIRROR_SYNC_INTERVAL");

    let mut slots: Vec<u32> = env
        .keys()
        .filter_map(|k| {
            k.strip_prefix("MIRROR")
                .and_then(|rest| rest.strip_suffix("_URL"))
                .and_then(|n| n.parse().ok())
        })
        .collect();
    slots.sort_unstable();
    slots.dedup();

    for slot in slots {
        let raw_url = &env[&format!("MIRROR{slot}_URL")];
        let url = match normalize_url(raw_url) {
            Ok(url) => url,
            Err(err) => {
                warn!(slot, url = raw_url.as_str(), "invalid mirror URL, dropping slot: {err:#}");
                continue;
            }
        };

        let email = env
            .get(&format!("MIRROR{slot}_EMAIL"))
            .or_else(|| env.get("MIRROR_EMAIL"));
        let password = env
            .get(&format!("MIRROR{slot}_PASSWORD"))
            .or_else(|| env.get("MIRROR_PASSWORD"));
        let (Some(email), Some(password)) = (email, password) else {
            warn!(slot, url = url.as_str(), "mirror slot has no credentials, dropping");
            continue;
        };

        note_interval(
            env.get(&format!("MIRROR{slot}_SYNC_INTERVAL")),
            "slot interval",
        );
        targets.push(MirrorTarget {
            url,
            email: email.clone(),
            password: password.clone(),
        });
    }

    if let Some(list) = env.get("MIRROR_URLS") {
        for raw_url in list.split(',').map(str::trim).filter(|u| !u.is_empty()) {
            let url = match normalize_url(raw_url) {
                Ok(url) => url,
                Err(err) => {
                    warn!(url = raw_url, "invalid mirror URL in MIRROR_URLS, dropping: {err:#}");
                    continue;
                }
            };
            if targets.iter().any(|t| t.url == url) {
                continue;
            }

            let host_key = Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(host_env_key))
                .unwrap_or_default();
            let email = env
                .get(&format!("MIRROR_{host_key}_EMAIL"))
                .or_else(|| env.get("MIRROR_EMAIL"));
            let password = env
                .get(&format!("MIRROR_{host_key}_PASSWORD"))
                .or_else(|| env.get("MIRROR_PASSWORD"));
            let (Some(email), Some(password)) = (email, password) else {
                warn!(url = url.as_str(), "mirror URL has no credentials, dropping");
                continue;
            };

            targets.push(MirrorTarget {
                url,
                email: email.clone(),
                password: password.clone(),
            });
        }
    }

    let interval = Duration::from_secs(interval_secs.max(MIN_SYNC_INTERVAL_SECS));
    (targets, interval)
}

fn host_env_key(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Starts the mirror task when targets exist; either way the returned
/// handle is what the reconciler signals.
pub fn start(
    primary: Arc<NpmClient>,
    targets: Vec<MirrorTarget>,
    interval: Duration,
) -> Result<Arc<dyn MirrorHandle>> {
    if targets.is_empty() {
        info!("no mirror targets configured, mirror sync inactive");
        return Ok(Arc::new(InactiveMirror));
    }

    let mut mirrors = Vec::with_capacity(targets.len());
    for target in &targets {
        mirrors.push(NpmClient::new(
            target.url.clone(),
            target.email.clone(),
            target.password.clone(),
        )?);
    }

    let notify = Arc::new(Notify::new());
    let scheduler = Arc::new(MirrorScheduler {
        primary,
        mirrors,
        interval,
        notify: notify.clone(),
        sync_lock: Mutex::new(()),
    });
    info!(
        mirrors = targets.len(),
        interval_secs = interval.as_secs(),
        "mirror scheduler active"
    );
    tokio::spawn(async move { scheduler.run().await });

    Ok(Arc::new(ActiveMirror { notify }))
}

struct MirrorScheduler {
    primary: Arc<NpmClient>,
    mirrors: Vec<NpmClient>,
    interval: Duration,
    notify: Arc<Notify>,
    sync_lock: Mutex<()>,
}

impl MirrorScheduler {
    async fn run(self: Arc<Self>) {
        self.sync_all().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.notify.notified() => debug!("early mirror sync requested"),
            }
            self.sync_all().await;
        }
    }

    async fn sync_all(&self) {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            debug!("mirror sync already in progress, skipping");
            return;
        };

        for mirror in &self.mirrors {
            info!(mirror = mirror.base_url(), "mirror sync starting");
            match resources::sync_instance(&self.primary, mirror).await {
                Ok(report) => info!(
                    mirror = mirror.base_url(),
                    synced = report.synced,
                    skipped = report.skipped,
                    "mirror sync finished"
                ),
                Err(err) => error!(mirror = mirror.base_url(), "mirror sync failed: {err:#}"),
            }
        }
    }
}
