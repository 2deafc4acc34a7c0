use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RequestSettings;
use crate::core::error::EnvError;
use crate::environments::{DiskDescriptor, RuntimeRecord};
use crate::utils::rate_limit::RequestPacer;

use super::{CreateRuntimeRequest, ProvisioningClient, UpdateRuntimeRequest};

/// Backoff strategies for retried requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    Linear,
    Exponential,
    Constant,
}

/// Retry tuning for the provisioning client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
}

impl RetryConfig {
    pub fn from_settings(settings: &RequestSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff_strategy {
            BackoffStrategy::Linear => self.base_delay * (attempt + 1),
            BackoffStrategy::Exponential => self.base_delay * 2u32.saturating_pow(attempt),
            BackoffStrategy::Constant => self.base_delay,
        }
    }
}

/// HTTP implementation of the provisioning boundary.
///
/// Transport errors, 429s and 5xx responses are retried with backoff; other
/// non-success responses are surfaced immediately. All requests share one
/// pacer so retries never burst past the service's rate limits.
pub struct HttpProvisioningClient {
    base_url: String,
    client: Client<HttpsConnector<HttpConnector>>,
    retry: RetryConfig,
    pacer: RequestPacer,
}

impl HttpProvisioningClient {
    pub fn new(base_url: impl Into<String>, settings: &RequestSettings) -> Self {
        let https = HttpsConnector::new();
        let client = Client::builder().build::<_, Body>(https);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry: RetryConfig::from_settings(settings),
            pacer: RequestPacer::new(settings.min_request_interval_ms),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.delay_for(attempt - 1);
                debug!(%url, attempt, delay_ms = delay.as_millis() as u64, "Retrying request");
                tokio::time::sleep(delay).await;
            }
            self.pacer.pace().await;

            let mut builder = Request::builder().method(method.clone()).uri(url);
            if body.is_some() {
                builder = builder.header("Content-Type", "application/json");
            }
            let request = match &body {
                Some(bytes) => builder.body(Body::from(bytes.clone())),
                None => builder.body(Body::empty()),
            }
            .context("Failed to build request")?;

            match self.client.request(request).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(%url, %status, "Provisioning service not ready, will retry");
                        last_error = Some(anyhow!(EnvError::ProvisioningError(format!(
                            "{} returned {}",
                            url, status
                        ))));
                        continue;
                    }
                    let bytes = hyper::body::to_bytes(response.into_body())
                        .await
                        .context("Failed to read response body")?;
                    return Ok((status, bytes.to_vec()));
                }
                Err(e) => {
                    warn!(%url, error = %e, "Request failed, will retry");
                    last_error = Some(e.into());
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("request to {} failed", url)))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let (status, bytes) = self.send(Method::GET, &url, None).await?;
        if !status.is_success() {
            return Err(anyhow!(EnvError::ProvisioningError(format!(
                "GET {} returned {}",
                url, status
            ))));
        }
        serde_json::from_slice(&bytes).with_context(|| format!("Malformed response from {}", url))
    }

    async fn expect_success<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<()> {
        let url = self.url(path);
        let bytes = body.map(serde_json::to_vec).transpose()?;
        let (status, response) = self.send(method.clone(), &url, bytes).await?;
        if !status.is_success() {
            let detail = String::from_utf8_lossy(&response);
            return Err(anyhow!(EnvError::ProvisioningError(format!(
                "{} {} returned {}: {}",
                method, url, status, detail
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningClient for HttpProvisioningClient {
    async fn list_runtimes(&self, project: &str) -> Result<Vec<RuntimeRecord>> {
        self.get_json(&format!("/api/v1/runtimes/{}", project)).await
    }

    async fn list_disks(&self, project: &str) -> Result<Vec<DiskDescriptor>> {
        self.get_json(&format!("/api/v1/disks/{}", project)).await
    }

    async fn create_runtime(
        &self,
        project: &str,
        name: &str,
        request: &CreateRuntimeRequest,
    ) -> Result<()> {
        self.expect_success(
            Method::POST,
            &format!("/api/v1/runtimes/{}/{}", project, name),
            Some(request),
        )
        .await
    }

    async fn update_runtime(
        &self,
        project: &str,
        name: &str,
        request: &UpdateRuntimeRequest,
    ) -> Result<()> {
        self.expect_success(
            Method::PATCH,
            &format!("/api/v1/runtimes/{}/{}", project, name),
            Some(request),
        )
        .await
    }

    async fn delete_runtime(
        &self,
        project: &str,
        name: &str,
        also_delete_disk: bool,
    ) -> Result<()> {
        self.expect_success::<()>(
            Method::DELETE,
            &format!(
                "/api/v1/runtimes/{}/{}?deleteDisk={}",
                project, name, also_delete_disk
            ),
            None,
        )
        .await
    }

    async fn update_disk(&self, project: &str, name: &str, new_size_gb: u32) -> Result<()> {
        self.expect_success(
            Method::PATCH,
            &format!("/api/v1/disks/{}/{}", project, name),
            Some(&serde_json::json!({ "size": new_size_gb })),
        )
        .await
    }

    async fn delete_disk(&self, project: &str, name: &str) -> Result<()> {
        self.expect_success::<()>(
            Method::DELETE,
            &format!("/api/v1/disks/{}/{}", project, name),
            None,
        )
        .await
    }
}
