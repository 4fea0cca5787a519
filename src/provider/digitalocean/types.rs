//! DigitalOcean API payloads.

use serde::{Deserialize, Serialize};

/// A load balancer as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Unique identifier.
    pub id: String,
    /// Load balancer name.
    pub name: String,
    /// Public IPv4 address. Empty until one is assigned.
    #[serde(default)]
    pub ip: String,
    /// Balancing algorithm, e.g. `round_robin`.
    #[serde(default)]
    pub algorithm: String,
    /// Lifecycle status, e.g. `new` or `active`.
    #[serde(default)]
    pub status: String,
    /// Datacenter region.
    pub region: Region,
    /// Droplets receiving traffic.
    #[serde(default)]
    pub droplet_ids: Vec<i64>,
}

/// Region reference embedded in API objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    /// Region slug, e.g. `nyc1`.
    pub slug: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// Body of a create request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateLoadBalancerRequest {
    /// Load balancer name.
    pub name: String,
    /// Balancing algorithm.
    pub algorithm: String,
    /// Region slug.
    pub region: String,
    /// Initial droplets.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub droplet_ids: Vec<i64>,
}

/// `{"load_balancer": {...}}` wrapper used by single-object responses.
#[derive(Debug, Deserialize)]
pub(super) struct LoadBalancerEnvelope {
    pub load_balancer: LoadBalancer,
}

/// Body of the droplet add/remove endpoints.
#[derive(Debug, Serialize)]
pub(super) struct DropletIds<'a> {
    pub droplet_ids: &'a [i64],
}

/// Error body returned on non-2xx responses.
#[derive(Debug, Deserialize)]
pub(super) struct ApiErrorBody {
    #[serde(default)]
    pub id: String,
    pub message: String,
}
