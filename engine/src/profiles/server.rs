//! Basic server profile: one flavor, one image, optional networks. The
//! reference profile type the builtin policies declare applicability for.

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use drover_common::{Error, Result};

use crate::context::EngineContext;
use crate::drivers::ServerRequest;
use crate::models::Node;

use super::ProfilePlugin;

pub const TYPE_KEY: &str = "server.basic-1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProperties {
    pub flavor: String,
    pub image: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

pub struct BasicServerProfile {
    properties: ServerProperties,
}

pub fn factory(spec: &Value) -> Result<Box<dyn ProfilePlugin>> {
    let properties = spec.get("properties").cloned().unwrap_or(json!({}));
    let properties: ServerProperties = serde_json::from_value(properties)
        .map_err(|e| Error::InvalidSpec(format!("bad server profile spec: {e}")))?;
    Ok(Box::new(BasicServerProfile { properties }))
}

pub fn schema() -> Value {
    json!({
        "flavor": {"type": "string", "required": true,
                   "description": "Flavor of the servers to provision."},
        "image": {"type": "string", "required": true,
                  "description": "Image used to boot the servers."},
        "networks": {"type": "array", "items": {"type": "string"},
                     "description": "Networks the servers attach to."},
        "metadata": {"type": "object",
                     "description": "Key-value pairs passed to the server."},
    })
}

impl BasicServerProfile {
    fn request_for(&self, node: &Node) -> ServerRequest {
        ServerRequest {
            name: node.name.clone(),
            flavor: self.properties.flavor.clone(),
            image: self.properties.image.clone(),
            networks: self.properties.networks.clone(),
            metadata: self.properties.metadata.clone(),
        }
    }
}

#[async_trait]
impl ProfilePlugin for BasicServerProfile {
    fn type_key(&self) -> &'static str {
        TYPE_KEY
    }

    fn validate(&self) -> Result<()> {
        if self.properties.flavor.trim().is_empty() {
            return Err(Error::InvalidSpec("server profile needs a flavor".into()));
        }
        if self.properties.image.trim().is_empty() {
            return Err(Error::InvalidSpec("server profile needs an image".into()));
        }
        Ok(())
    }

    async fn create_node(&self, ctx: &EngineContext, node: &Node) -> Result<String> {
        let request = self.request_for(node);
        ctx.drivers
            .compute
            .server_create(&request)
            .await
            .map_err(Error::Internal)
    }

    async fn delete_node(&self, ctx: &EngineContext, node: &Node) -> Result<()> {
        let Some(ref physical_id) = node.physical_id else {
            // Never provisioned; nothing to tear down.
            return Ok(());
        };
        if physical_id.is_empty() {
            return Ok(());
        }
        ctx.drivers
            .compute
            .server_delete(physical_id)
            .await
            .map_err(Error::Internal)
    }

    async fn update_node(&self, ctx: &EngineContext, node: &Node, new_spec: &Value) -> Result<()> {
        let Some(ref physical_id) = node.physical_id else {
            return Err(Error::Internal(anyhow!(
                "node {} has no physical resource to update",
                node.id
            )));
        };
        let plugin = factory(new_spec)?;
        plugin.validate()?;
        // Rebuild the request from the new spec, keeping the node identity.
        let properties = new_spec.get("properties").cloned().unwrap_or(json!({}));
        let properties: ServerProperties = serde_json::from_value(properties)
            .map_err(|e| Error::InvalidSpec(format!("bad server profile spec: {e}")))?;
        let request = ServerRequest {
            name: node.name.clone(),
            flavor: properties.flavor,
            image: properties.image,
            networks: properties.networks,
            metadata: properties.metadata,
        };
        ctx.drivers
            .compute
            .server_update(physical_id, &request)
            .await
            .map_err(Error::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_parses_a_minimal_spec() {
        let spec = json!({
            "type": "server.basic",
            "version": "1.0",
            "properties": {"flavor": "m1.small", "image": "debian-12"},
        });
        let plugin = factory(&spec).unwrap();
        assert_eq!(plugin.type_key(), TYPE_KEY);
        assert!(plugin.validate().is_ok());
    }

    #[test]
    fn empty_flavor_fails_validation() {
        let spec = json!({"properties": {"flavor": " ", "image": "debian-12"}});
        let plugin = factory(&spec).unwrap();
        assert!(plugin.validate().is_err());
    }

    #[test]
    fn missing_required_field_is_an_invalid_spec() {
        let spec = json!({"properties": {"flavor": "m1.small"}});
        assert!(factory(&spec).is_err());
    }
}
