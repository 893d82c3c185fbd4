//! Profile plugin contract. A profile knows how to materialize, update and
//! tear down one node of its type through the compute driver seam.

pub mod server;

use async_trait::async_trait;
use serde_json::Value;

use drover_common::Result;

use crate::context::EngineContext;
use crate::models::Node;

#[async_trait]
pub trait ProfilePlugin: Send + Sync {
    /// Registry key, `type-version`.
    fn type_key(&self) -> &'static str;

    /// Check the parsed spec for semantic problems beyond shape.
    fn validate(&self) -> Result<()>;

    /// Provision the physical resource; returns the driver-assigned id.
    async fn create_node(&self, ctx: &EngineContext, node: &Node) -> Result<String>;

    async fn delete_node(&self, ctx: &EngineContext, node: &Node) -> Result<()>;

    /// Reshape an existing physical resource to a new spec.
    async fn update_node(&self, ctx: &EngineContext, node: &Node, new_spec: &Value) -> Result<()>;
}
