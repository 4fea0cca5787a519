//! DigitalOcean REST client.
//!
//! Only the load balancer endpoints are covered. Retries are left to the
//! executor; this client maps every failure onto a [`ProviderError`] so the
//! engine can tell transient failures from permanent ones.

use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, TerraceError};

use super::types::{
    ApiErrorBody, CreateLoadBalancerRequest, DropletIds, LoadBalancer, LoadBalancerEnvelope,
};

/// DigitalOcean API base URL.
pub const DIGITALOCEAN_API_URL: &str = "https://api.digitalocean.com";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// DigitalOcean API client.
#[derive(Debug, Clone)]
pub struct DigitalOceanClient {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// API token.
    token: String,
}

impl DigitalOceanClient {
    /// Creates a client against the public API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(token, DIGITALOCEAN_API_URL)
    }

    /// Creates a client against another endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_base_url(token: &str, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| TerraceError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Creates a load balancer.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn create_load_balancer(
        &self,
        request: &CreateLoadBalancerRequest,
    ) -> std::result::Result<LoadBalancer, ProviderError> {
        debug!("Creating load balancer {}", request.name);
        let builder = self.client.post(self.url("/v2/load_balancers")).json(request);
        let envelope: LoadBalancerEnvelope = self.fetch(builder, &request.name).await?;
        Ok(envelope.load_balancer)
    }

    /// Fetches a load balancer by id.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] if it does not exist.
    pub async fn get_load_balancer(&self, id: &str) -> std::result::Result<LoadBalancer, ProviderError> {
        let builder = self.client.get(self.load_balancer_url(id));
        let envelope: LoadBalancerEnvelope = self.fetch(builder, id).await?;
        Ok(envelope.load_balancer)
    }

    /// Deletes a load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::NotFound`] if it does not exist.
    pub async fn delete_load_balancer(&self, id: &str) -> std::result::Result<(), ProviderError> {
        debug!("Deleting load balancer {id}");
        self.send(self.client.delete(self.load_balancer_url(id)), id).await?;
        Ok(())
    }

    /// Attaches droplets to a load balancer.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn add_droplets(&self, id: &str, droplet_ids: &[i64]) -> std::result::Result<(), ProviderError> {
        debug!("Adding droplets {droplet_ids:?} to load balancer {id}");
        let builder = self
            .client
            .post(self.droplets_url(id))
            .json(&DropletIds { droplet_ids });
        self.send(builder, id).await?;
        Ok(())
    }

    /// Detaches droplets from a load balancer.
    ///
    /// # Errors
    ///
    /// Returns an error if the API call fails.
    pub async fn remove_droplets(&self, id: &str, droplet_ids: &[i64]) -> std::result::Result<(), ProviderError> {
        debug!("Removing droplets {droplet_ids:?} from load balancer {id}");
        let builder = self
            .client
            .delete(self.droplets_url(id))
            .json(&DropletIds { droplet_ids });
        self.send(builder, id).await?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn load_balancer_url(&self, id: &str) -> String {
        self.url(&format!("/v2/load_balancers/{id}"))
    }

    fn droplets_url(&self, id: &str) -> String {
        self.url(&format!("/v2/load_balancers/{id}/droplets"))
    }

    /// Sends a request and decodes a JSON body.
    async fn fetch<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        id: &str,
    ) -> std::result::Result<T, ProviderError> {
        let response = self.send(builder, id).await?;
        let status = response.status().as_u16();
        response
            .json()
            .await
            .map_err(|e| ProviderError::api(status, format!("Failed to parse response: {e}")))
    }

    /// Sends a request, mapping non-2xx statuses and transport failures.
    async fn send(&self, builder: RequestBuilder, id: &str) -> std::result::Result<Response, ProviderError> {
        let request = builder
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json");

        let response = request.send().await.map_err(|e| transport_error(&e, id))?;
        let status = response.status();
        trace!("DigitalOcean responded {status}");

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, &body, id))
    }
}

/// Maps a non-2xx response.
fn status_error(status: StatusCode, body: &str, id: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiErrorBody>(body).map_or_else(
        |_| body.trim().to_string(),
        |e| {
            if e.id.is_empty() {
                e.message
            } else {
                format!("{}: {}", e.id, e.message)
            }
        },
    );

    match status {
        StatusCode::NOT_FOUND => ProviderError::not_found(id),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::transient(format!("rate limited: {message}")),
        s if s.is_server_error() => ProviderError::transient(format!("HTTP {}: {message}", s.as_u16())),
        s => ProviderError::api(s.as_u16(), message),
    }
}

/// Maps a failure that produced no usable response.
fn transport_error(error: &reqwest::Error, id: &str) -> ProviderError {
    if let Some(status) = error.status() {
        return status_error(status, &error.to_string(), id);
    }
    if error.is_timeout() || error.is_connect() {
        return ProviderError::transient(format!("Request failed: {error}"));
    }
    ProviderError::api(0, format!("Request failed: {error}"))
}
