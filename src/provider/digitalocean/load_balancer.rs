//! `digitalocean_loadbalancer` resource type.

use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::provider::{AttributeChanges, Capabilities, Created, ReadResult, ResourcePlugin};
use crate::schema::{AttributeMap, AttributeSchema, AttributeType, AttributeValue, ResourceSchema};

use super::client::DigitalOceanClient;
use super::types::{CreateLoadBalancerRequest, LoadBalancer};

/// Resource type name.
pub const LOAD_BALANCER_TYPE: &str = "digitalocean_loadbalancer";

/// Provider name recorded in state.
pub const PROVIDER_NAME: &str = "digitalocean";

/// Plugin managing DigitalOcean load balancers.
#[derive(Debug, Clone)]
pub struct LoadBalancerPlugin {
    client: DigitalOceanClient,
    schema: ResourceSchema,
}

impl LoadBalancerPlugin {
    /// Creates the plugin around an API client.
    #[must_use]
    pub fn new(client: DigitalOceanClient) -> Self {
        Self {
            client,
            schema: load_balancer_schema(),
        }
    }
}

/// Attribute schema of a load balancer.
#[must_use]
pub fn load_balancer_schema() -> ResourceSchema {
    ResourceSchema::new(1)
        .with_attribute(
            "name",
            AttributeSchema::required(AttributeType::String)
                .force_new()
                .describe("Load balancer name"),
        )
        .with_attribute(
            "algorithm",
            AttributeSchema::required(AttributeType::String)
                .force_new()
                .describe("Balancing algorithm, round_robin or least_connections"),
        )
        .with_attribute(
            "region",
            AttributeSchema::required(AttributeType::String)
                .force_new()
                .describe("Region slug"),
        )
        .with_attribute(
            "ip",
            AttributeSchema::computed(AttributeType::String).describe("Public IPv4 address"),
        )
        .with_attribute(
            "status",
            AttributeSchema::computed(AttributeType::String).authoritative(),
        )
        .with_attribute(
            "droplet_ids",
            AttributeSchema::optional_computed(AttributeType::set_of(AttributeType::Int))
                .authoritative()
                .describe("Droplets receiving traffic"),
        )
}

/// Converts an API object to attributes.
fn attributes_of(lb: &LoadBalancer) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    attributes.insert(String::from("name"), AttributeValue::string(&lb.name));
    attributes.insert(String::from("algorithm"), AttributeValue::string(&lb.algorithm));
    attributes.insert(String::from("region"), AttributeValue::string(&lb.region.slug));
    attributes.insert(String::from("ip"), AttributeValue::string(&lb.ip));
    attributes.insert(String::from("status"), AttributeValue::string(&lb.status));
    attributes.insert(
        String::from("droplet_ids"),
        AttributeValue::set(lb.droplet_ids.iter().copied().map(AttributeValue::Int)),
    );
    attributes
}

fn required_string(attributes: &AttributeMap, name: &str) -> Result<String, ProviderError> {
    attributes
        .get(name)
        .and_then(AttributeValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::validation(format!("{name} must be a string")))
}

/// Reads `droplet_ids`; absent means none.
fn droplet_ids(value: Option<&AttributeValue>) -> Result<BTreeSet<i64>, ProviderError> {
    let Some(value) = value else {
        return Ok(BTreeSet::new());
    };
    let set = value
        .as_set()
        .ok_or_else(|| ProviderError::validation("droplet_ids must be a set of integers"))?;
    set.iter()
        .map(|element| {
            element
                .as_int()
                .ok_or_else(|| ProviderError::validation("droplet_ids must be a set of integers"))
        })
        .collect()
}

#[async_trait]
impl ResourcePlugin for LoadBalancerPlugin {
    fn type_name(&self) -> &str {
        LOAD_BALANCER_TYPE
    }

    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            create_before_destroy: false,
            import: true,
        }
    }

    async fn create(&self, desired: &AttributeMap) -> Result<Created, ProviderError> {
        let request = CreateLoadBalancerRequest {
            name: required_string(desired, "name")?,
            algorithm: required_string(desired, "algorithm")?,
            region: required_string(desired, "region")?,
            droplet_ids: droplet_ids(desired.get("droplet_ids"))?.into_iter().collect(),
        };

        let lb = self.client.create_load_balancer(&request).await?;
        info!("Created load balancer {} ({})", lb.name, lb.id);

        Ok(Created {
            id: lb.id.clone(),
            attributes: attributes_of(&lb),
        })
    }

    async fn read(&self, id: &str) -> Result<ReadResult, ProviderError> {
        match self.client.get_load_balancer(id).await {
            Ok(lb) => Ok(ReadResult::Found(attributes_of(&lb))),
            Err(e) if e.is_not_found() => {
                debug!("Load balancer {id} no longer exists");
                Ok(ReadResult::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, id: &str, changes: &AttributeChanges) -> Result<AttributeMap, ProviderError> {
        if let Some(name) = changes.names().find(|name| *name != "droplet_ids") {
            return Err(ProviderError::validation(format!(
                "{name} cannot be changed in place"
            )));
        }

        let target = if changes.removed.contains("droplet_ids") {
            Some(BTreeSet::new())
        } else {
            changes.set.get("droplet_ids").map(|value| droplet_ids(Some(value))).transpose()?
        };

        if let Some(desired) = target {
            let live: BTreeSet<i64> = self
                .client
                .get_load_balancer(id)
                .await?
                .droplet_ids
                .into_iter()
                .collect();

            let added: Vec<i64> = desired.difference(&live).copied().collect();
            let removed: Vec<i64> = live.difference(&desired).copied().collect();

            if !added.is_empty() {
                self.client.add_droplets(id, &added).await?;
            }
            if !removed.is_empty() {
                self.client.remove_droplets(id, &removed).await?;
            }
        }

        let lb = self.client.get_load_balancer(id).await?;
        Ok(attributes_of(&lb))
    }

    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.client.delete_load_balancer(id).await?;
        info!("Deleted load balancer {id}");
        Ok(())
    }

    async fn import(&self, id: &str) -> Result<AttributeMap, ProviderError> {
        let lb = self.client.get_load_balancer(id).await?;
        Ok(attributes_of(&lb))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::attrs;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn plugin(server: &MockServer) -> LoadBalancerPlugin {
        LoadBalancerPlugin::new(DigitalOceanClient::with_base_url("secret", &server.uri()).unwrap())
    }

    fn lb_body(droplets: &[i64]) -> serde_json::Value {
        json!({
            "load_balancer": {
                "id": "4de7ac8b",
                "name": "web",
                "ip": "203.0.113.7",
                "algorithm": "round_robin",
                "status": "active",
                "region": {"slug": "nyc1", "name": "New York 1"},
                "droplet_ids": droplets,
            }
        })
    }

    fn ids(values: &[i64]) -> AttributeValue {
        AttributeValue::set(values.iter().copied().map(AttributeValue::Int))
    }

    fn setting(pairs: &[(&str, AttributeValue)]) -> AttributeChanges {
        AttributeChanges {
            set: attrs(pairs),
            ..AttributeChanges::default()
        }
    }

    #[test]
    fn test_schema_is_valid() {
        let schema = load_balancer_schema();
        assert!(schema.check().is_ok());
        assert!(schema.attribute("region").is_some_and(|a| a.force_new));
        assert!(schema.attribute("ip").is_some_and(AttributeSchema::is_computed_only));
    }

    #[tokio::test]
    async fn test_create_posts_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/load_balancers"))
            .and(body_json(json!({
                "name": "web",
                "algorithm": "round_robin",
                "region": "nyc1",
                "droplet_ids": [1, 2],
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(lb_body(&[1, 2])))
            .expect(1)
            .mount(&server)
            .await;

        let created = plugin(&server)
            .create(&attrs(&[
                ("name", AttributeValue::string("web")),
                ("algorithm", AttributeValue::string("round_robin")),
                ("region", AttributeValue::string("nyc1")),
                ("droplet_ids", ids(&[2, 1])),
            ]))
            .await
            .unwrap();

        assert_eq!(created.id, "4de7ac8b");
        assert_eq!(created.attributes["ip"], AttributeValue::string("203.0.113.7"));
        assert_eq!(created.attributes["region"], AttributeValue::string("nyc1"));
        assert_eq!(created.attributes["droplet_ids"], ids(&[1, 2]));
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let server = MockServer::start().await;
        let err = plugin(&server)
            .create(&attrs(&[("region", AttributeValue::string("nyc1"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_read_missing_reports_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let result = plugin(&server).read("4de7ac8b").await.unwrap();
        assert_eq!(result, ReadResult::NotFound);
    }

    #[tokio::test]
    async fn test_update_applies_droplet_delta() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lb_body(&[1, 2])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/load_balancers/4de7ac8b/droplets"))
            .and(body_json(json!({"droplet_ids": [3]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/load_balancers/4de7ac8b/droplets"))
            .and(body_json(json!({"droplet_ids": [1]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lb_body(&[2, 3])))
            .mount(&server)
            .await;

        let live = plugin(&server)
            .update("4de7ac8b", &setting(&[("droplet_ids", ids(&[2, 3]))]))
            .await
            .unwrap();

        assert_eq!(live["droplet_ids"], ids(&[2, 3]));
    }

    #[tokio::test]
    async fn test_update_rejects_force_new_attribute() {
        let server = MockServer::start().await;
        let err = plugin(&server)
            .update("4de7ac8b", &setting(&[("region", AttributeValue::string("ams3"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_update_rejects_removed_required_attribute() {
        let server = MockServer::start().await;
        let changes = AttributeChanges {
            removed: BTreeSet::from([String::from("algorithm")]),
            ..AttributeChanges::default()
        };
        let err = plugin(&server).update("4de7ac8b", &changes).await.unwrap_err();
        assert!(matches!(err, ProviderError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_update_removed_droplets_detaches_all() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lb_body(&[1, 2])))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v2/load_balancers/4de7ac8b/droplets"))
            .and(body_json(json!({"droplet_ids": [1, 2]})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lb_body(&[])))
            .mount(&server)
            .await;

        let changes = AttributeChanges {
            removed: BTreeSet::from([String::from("droplet_ids")]),
            ..AttributeChanges::default()
        };
        let live = plugin(&server).update("4de7ac8b", &changes).await.unwrap();

        assert_eq!(live["droplet_ids"], ids(&[]));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = plugin(&server).delete("4de7ac8b").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_import_reads_attributes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/load_balancers/4de7ac8b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(lb_body(&[7])))
            .mount(&server)
            .await;

        let imported = plugin(&server).import("4de7ac8b").await.unwrap();
        assert_eq!(imported["name"], AttributeValue::string("web"));
        assert_eq!(imported["algorithm"], AttributeValue::string("round_robin"));
        assert_eq!(imported["droplet_ids"], ids(&[7]));
    }
}
