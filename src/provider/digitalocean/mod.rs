//! DigitalOcean provider.
//!
//! Currently offers a single resource type, [`LOAD_BALANCER_TYPE`].

mod client;
mod load_balancer;
mod types;

pub use client::{DIGITALOCEAN_API_URL, DigitalOceanClient};
pub use load_balancer::{LOAD_BALANCER_TYPE, LoadBalancerPlugin, PROVIDER_NAME, load_balancer_schema};
pub use types::{CreateLoadBalancerRequest, LoadBalancer, Region};
