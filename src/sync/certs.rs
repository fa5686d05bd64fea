use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::npm::models::Certificate;
use crate::npm::NpmClient;

const CERT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Picks an existing NPM certificate for a set of requested domains.
/// The certificate list changes rarely, so it is cached briefly.
pub struct CertificateMatcher {
    npm: Arc<NpmClient>,
    cache: Mutex<Option<(Instant, Arc<Vec<Certificate>>)>>,
}

impl CertificateMatcher {
    pub fn new(npm: Arc<NpmClient>) -> Self {
        Self {
            npm,
            cache: Mutex::new(None),
        }
    }

    /// Certificate id for `domains`, or `None` when nothing matches or the
    /// list cannot be fetched; the caller proceeds without SSL either way.
    pub async fn find_certificate(&self, domains: &[String]) -> Option<i64> {
        let certificates = match self.certificates().await {
            Ok(certs) => certs,
            Err(err) => {
                warn!("failed to fetch certificate list: {err:#}");
                return None;
            }
        };
        let found = select_certificate(&certificates, domains);
        if let Some(id) = found {
            debug!(certificate_id = id, requested = ?domains, "matched certificate");
        }
        found
    }

    async fn certificates(&self) -> crate::npm::NpmResult<Arc<Vec<Certificate>>> {
        let mut guard = self.cache.lock().await;
        if let Some((fetched, certs)) = guard.as_ref() {
            if fetched.elapsed() < CERT_CACHE_TTL {
                return Ok(certs.clone());
            }
        }

        let certs: Vec<Certificate> = self
            .npm
            .list_certificates()
            .await?
            .into_iter()
            .filter(|c| !c.is_deleted)
            .collect();
        let certs = Arc::new(certs);
        *guard = Some((Instant::now(), certs.clone()));
        Ok(certs)
    }
}

/// Matching strategies in order, first hit wins:
/// 1. exact: the certificate covers every requested domain;
/// 2. primary: the certificate covers the first requested domain;
/// 3. wildcard: a `*.root` entry covers the primary domain.
pub fn select_certificate(certificates: &[Certificate], domains: &[String]) -> Option<i64> {
    let requested: Vec<String> = domains.iter().map(|d| d.to_ascii_lowercase()).collect();
    let primary = requested.first()?;

    let covers = |cert: &Certificate, domain: &str| {
        cert.domain_names
            .iter()
            .any(|d| d.to_ascii_lowercase() == domain)
    };

    if let Some(cert) = certificates
        .iter()
        .find(|c| requested.iter().all(|d| covers(c, d)))
    {
        return Some(cert.id);
    }

    if let Some(cert) = certificates.iter().find(|c| covers(c, primary)) {
        return Some(cert.id);
    }

    certificates
        .iter()
        .find(|c| {
            c.domain_names.iter().any(|d| {
                let d = d.to_ascii_lowercase();
                let Some(root) = d.strip_prefix("*.") else {
                    return false;
                };
                primary
                    .strip_suffix(root)
                    .and_then(|rest| rest.strip_suffix('.'))
                    .is_some_and(|left| !left.is_empty())
            })
        })
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(id: i64, domains: &[&str]) -> Certificate {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "nice_name": format!("cert-{id}"),
            "domain_names": domains,
            "is_deleted": 0,
        }))
        .unwrap()
    }

    fn req(domains: &[&str]) -> Vec<String> {
        domains.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn exact_match_wins_over_primary() {
        let certs = vec![
            cert(1, &["a.test"]),
            cert(2, &["a.test", "b.test"]),
        ];
        assert_eq!(select_certificate(&certs, &req(&["a.test", "b.test"])), Some(2));
    }

    #[test]
    fn primary_match_when_no_cert_covers_all() {
        let certs = vec![cert(1, &["a.test"])];
        assert_eq!(select_certificate(&certs, &req(&["a.test", "b.test"])), Some(1));
    }

    #[test]
    fn wildcard_covers_one_extra_label() {
        let certs = vec![cert(7, &["*.test"])];
        assert_eq!(select_certificate(&certs, &req(&["svc.test"])), Some(7));
    }

    #[test]
    fn wildcard_does_not_cover_the_root_itself() {
        let certs = vec![cert(7, &["*.example.com"])];
        assert_eq!(select_certificate(&certs, &req(&["example.com"])), None);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let certs = vec![cert(3, &["Svc.Test"])];
        assert_eq!(select_certificate(&certs, &req(&["svc.test"])), Some(3));
        let certs = vec![cert(4, &["svc.test"])];
        assert_eq!(select_certificate(&certs, &req(&["SVC.TEST"])), Some(4));
    }

    #[test]
    fn no_match_returns_none() {
        let certs = vec![cert(1, &["other.test"])];
        assert_eq!(select_certificate(&certs, &req(&["svc.example"])), None);
    }

    #[test]
    fn empty_request_matches_nothing() {
        let certs = vec![cert(1, &["a.test"])];
        assert_eq!(select_certificate(&certs, &req(&[])), None);
    }
}
