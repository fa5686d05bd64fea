use std::time::{Duration, Instant};

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::models::{
    Certificate, CreatedResource, ProxyHost, ProxyHostPayload, ResourceKind, StreamHost,
    StreamPayload,
};

/// NPM tokens live 24 hours; refreshing an hour early keeps a cached token
/// from expiring mid-call.
const TOKEN_TTL: Duration = Duration::from_secs(23 * 60 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum NpmError {
    #[error("authentication with {url} failed: {reason}")]
    Auth { url: String, reason: String },

    /// NPM rejects duplicate listening ports and duplicate domain names with
    /// a client error whose body names the value in use.
    #[error("rejected as already in use: {detail}")]
    Conflict { detail: String },

    #[error("unexpected status {status} from {url}: {body}")]
    Status {
        status: StatusCode,
        url: String,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type NpmResult<T> = Result<T, NpmError>;

struct CachedToken {
    token: String,
    acquired: Instant,
}

impl CachedToken {
    fn fresh(&self) -> bool {
        self.acquired.elapsed() < TOKEN_TTL
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// Token-authenticated client for one NPM instance. The reconciler drives
/// the typed surface; the mirror layer uses the raw `Value` surface so it
/// can handle every resource kind uniformly.
pub struct NpmClient {
    client: reqwest::Client,
    base_url: String,
    email: String,
    password: String,
    token: RwLock<Option<CachedToken>>,
}

impl NpmClient {
    /// `base_url` must already be normalized (see [`super::normalize_url`]).
    pub fn new(base_url: String, email: String, password: String) -> NpmResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url,
            email,
            password,
            token: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns a fresh token, authenticating at most once per TTL. Refresh
    /// is serialized behind the write lock with a double-check so concurrent
    /// callers share one `/api/tokens` round trip.
    async fn ensure_token(&self) -> NpmResult<String> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.fresh() {
                return Ok(cached.token.clone());
            }
        }

        let mut slot = self.token.write().await;
        if let Some(cached) = slot.as_ref() {
            if cached.fresh() {
                return Ok(cached.token.clone());
            }
        }

        debug!(url = %self.base_url, "requesting NPM API token");
        let response = self
            .client
            .post(format!("{}/api/tokens", self.base_url))
            .json(&serde_json::json!({
                "identity": self.email,
                "secret": self.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NpmError::Auth {
                url: self.base_url.clone(),
                reason: format!("{status}: {body}"),
            });
        }

        let token = response.json::<TokenResponse>().await?.token;
        *slot = Some(CachedToken {
            token: token.clone(),
            acquired: Instant::now(),
        });
        Ok(token)
    }

    /// Sends an authenticated request. A 401 invalidates the cached token
    /// and retries once with a fresh one.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
    ) -> NpmResult<reqwest::Response> {
        for attempt in 0..2 {
            let token = self.ensure_token().await?;
            let mut request = self.client.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            if response.status() == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(url, "NPM token rejected, re-authenticating");
                self.token.write().await.take();
                continue;
            }
            return Ok(response);
        }
        unreachable!("second attempt always returns");
    }

    async fn checked(response: reqwest::Response) -> NpmResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() && body.to_ascii_lowercase().contains("in use") {
            return Err(NpmError::Conflict { detail: body });
        }
        Err(NpmError::Status { status, url, body })
    }

    fn collection_url(&self, kind: ResourceKind) -> String {
        format!("{}/api/{}", self.base_url, kind.api_path())
    }

    fn item_url(&self, kind: ResourceKind, id: i64) -> String {
        format!("{}/api/{}/{id}", self.base_url, kind.api_path())
    }

    // -- typed surface (reconciler) -----------------------------------------

    pub async fn list_proxy_hosts(&self) -> NpmResult<Vec<ProxyHost>> {
        let url = self.collection_url(ResourceKind::ProxyHost);
        let response = Self::checked(self.execute(Method::GET, &url, None).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn create_proxy_host(&self, payload: &ProxyHostPayload) -> NpmResult<i64> {
        let url = self.collection_url(ResourceKind::ProxyHost);
        let body = serde_json::to_value(payload)?;
        let response = Self::checked(self.execute(Method::POST, &url, Some(&body)).await?).await?;
        Ok(response.json::<CreatedResource>().await?.id)
    }

    pub async fn list_streams(&self) -> NpmResult<Vec<StreamHost>> {
        let url = self.collection_url(ResourceKind::Stream);
        let response = Self::checked(self.execute(Method::GET, &url, None).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn create_stream(&self, payload: &StreamPayload) -> NpmResult<i64> {
        let url = self.collection_url(ResourceKind::Stream);
        let body = serde_json::to_value(payload)?;
        let response = Self::checked(self.execute(Method::POST, &url, Some(&body)).await?).await?;
        Ok(response.json::<CreatedResource>().await?.id)
    }

    pub async fn list_certificates(&self) -> NpmResult<Vec<Certificate>> {
        let url = self.collection_url(ResourceKind::Certificate);
        let response = Self::checked(self.execute(Method::GET, &url, None).await?).await?;
        Ok(response.json().await?)
    }

    /// Deletes by id; a 404 counts as success so retries and races with a
    /// restarted NPM stay quiet.
    pub async fn delete_resource(&self, kind: ResourceKind, id: i64) -> NpmResult<()> {
        let url = self.item_url(kind, id);
        let response = self.execute(Method::DELETE, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%kind, id, "delete target already gone");
            return Ok(());
        }
        Self::checked(response).await?;
        Ok(())
    }

    // -- raw surface (mirror) -----------------------------------------------

    pub async fn list_raw(&self, kind: ResourceKind) -> NpmResult<Vec<serde_json::Value>> {
        let url = self.collection_url(kind);
        let response = Self::checked(self.execute(Method::GET, &url, None).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn create_raw(
        &self,
        kind: ResourceKind,
        payload: &serde_json::Value,
    ) -> NpmResult<serde_json::Value> {
        let url = self.collection_url(kind);
        let response = Self::checked(self.execute(Method::POST, &url, Some(payload)).await?).await?;
        Ok(response.json().await?)
    }

    pub async fn update_raw(
        &self,
        kind: ResourceKind,
        id: i64,
        payload: &serde_json::Value,
    ) -> NpmResult<serde_json::Value> {
        let url = self.item_url(kind, id);
        let response = Self::checked(self.execute(Method::PUT, &url, Some(payload)).await?).await?;
        Ok(response.json().await?)
    }
}
