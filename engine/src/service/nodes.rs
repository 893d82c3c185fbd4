use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms};

use crate::db;
use crate::models::{ActionInputs, Node, NodeStatus};

use super::{EngineService, ListRequest, apply_filters, to_dicts};

#[derive(Debug, Deserialize)]
pub struct NodeCreateRequest {
    pub name: String,
    pub profile_id: String,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct NodeUpdateRequest {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct NodeListRequest {
    #[serde(flatten)]
    pub list: ListRequest,
    #[serde(default)]
    pub cluster_id: Option<String>,
}

impl EngineService {
    pub async fn node_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Node> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::nodes::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::nodes::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && Uuid::parse_str(identity).is_err() {
            found = db::nodes::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "node",
            id: identity.to_string(),
        })
    }

    pub async fn node_list(&self, rctx: &RequestContext, req: NodeListRequest) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req.list)?;
        let cluster_id = match req.cluster_id.as_deref() {
            Some(identity) => Some(self.cluster_find(rctx, identity, false).await?.id),
            None => None,
        };
        let nodes = db::nodes::list(&self.ctx.pool, &list_params, cluster_id).await?;
        Ok(apply_filters(to_dicts(nodes)?, req.list.filters.as_ref()))
    }

    pub async fn node_create(
        &self,
        rctx: &RequestContext,
        req: NodeCreateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let profile = self.profile_find(rctx, &req.profile_id, false).await?;

        let (cluster_id, index) = match req.cluster_id.as_deref() {
            Some(identity) => {
                let cluster = self.cluster_find(rctx, identity, false).await?;
                if profile.id != cluster.profile_id {
                    let cluster_profile = db::profiles::get(pool, cluster.profile_id, true)
                        .await?
                        .ok_or(Error::NotFound {
                            kind: "profile",
                            id: cluster.profile_id.to_string(),
                        })?;
                    if profile.type_name != cluster_profile.type_name {
                        return Err(Error::ProfileTypeNotMatch(
                            "node and cluster have different profile types".into(),
                        ));
                    }
                }
                let index = db::nodes::next_index(pool, cluster.id).await?;
                (Some(cluster.id), index)
            }
            None => (None, -1),
        };

        tracing::info!(name = %req.name, "creating node");
        let now = now_ms();
        let node = Node {
            id: Uuid::new_v4(),
            name: req.name,
            profile_id: profile.id,
            cluster_id,
            role: req.role,
            index,
            status: NodeStatus::Init,
            status_reason: "initializing".into(),
            physical_id: None,
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            metadata: req.metadata.unwrap_or(json!({})),
            data: json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::nodes::insert(pool, &node).await?;

        let action = self
            .submit_action(
                rctx,
                "node_create",
                node.id,
                ActionInputs::NodeCreate,
                self.ctx.defaults.action_timeout,
            )
            .await?;

        let mut result = serde_json::to_value(&node).map_err(|e| Error::Internal(e.into()))?;
        result["action"] = json!(action);
        Ok(result)
    }

    pub async fn node_get(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_details: bool,
    ) -> Result<Value> {
        let node = self.node_find(rctx, identity, false).await?;
        let mut result = serde_json::to_value(&node).map_err(|e| Error::Internal(e.into()))?;
        if show_details && node.physical_id.as_deref().is_some_and(|p| !p.is_empty()) {
            result["details"] = json!({"physical_id": node.physical_id});
        }
        Ok(result)
    }

    pub async fn node_update(
        &self,
        rctx: &RequestContext,
        req: NodeUpdateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let node = self.node_find(rctx, &req.identity, false).await?;

        let new_profile_id = match req.profile_id.as_deref() {
            Some(identity) => {
                let new_profile = self.profile_find(rctx, identity, false).await?;
                let old_profile = db::profiles::get(pool, node.profile_id, true)
                    .await?
                    .ok_or(Error::NotFound {
                        kind: "profile",
                        id: node.profile_id.to_string(),
                    })?;
                if new_profile.type_name != old_profile.type_name {
                    return Err(Error::ProfileTypeNotMatch(
                        "cannot update a node to a different profile type".into(),
                    ));
                }
                Some(new_profile.id)
            }
            None => None,
        };

        tracing::info!(node = %req.identity, "updating node");
        let action = self
            .submit_action(
                rctx,
                "node_update",
                node.id,
                ActionInputs::NodeUpdate {
                    new_profile_id,
                    name: req.name.filter(|n| *n != node.name),
                    role: req.role.filter(|r| Some(r) != node.role.as_ref()),
                    metadata: req.metadata.filter(|m| *m != node.metadata),
                },
                self.ctx.defaults.action_timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn node_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let node = self.node_find(rctx, identity, false).await?;
        tracing::info!(node = %identity, "deleting node");
        let action = self
            .submit_action(
                rctx,
                "node_delete",
                node.id,
                ActionInputs::NodeDelete,
                self.ctx.defaults.action_timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn node_join(
        &self,
        rctx: &RequestContext,
        identity: &str,
        cluster_identity: &str,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let node = self.node_find(rctx, identity, false).await?;
        let cluster = self.cluster_find(rctx, cluster_identity, false).await?;

        if node.cluster_id.is_some() {
            return Err(Error::NodeNotOrphan(format!(
                "node {identity} already belongs to a cluster"
            )));
        }
        if node.profile_id != cluster.profile_id {
            let node_profile = db::profiles::get(pool, node.profile_id, true)
                .await?
                .ok_or(Error::NotFound {
                    kind: "profile",
                    id: node.profile_id.to_string(),
                })?;
            let cluster_profile = db::profiles::get(pool, cluster.profile_id, true)
                .await?
                .ok_or(Error::NotFound {
                    kind: "profile",
                    id: cluster.profile_id.to_string(),
                })?;
            if node_profile.type_name != cluster_profile.type_name {
                return Err(Error::ProfileTypeNotMatch(
                    "node and cluster have different profile types".into(),
                ));
            }
        }

        tracing::info!(node = %identity, cluster = %cluster_identity, "joining node to cluster");
        let action = self
            .submit_action(
                rctx,
                "node_join",
                node.id,
                ActionInputs::NodeJoin {
                    cluster_id: cluster.id,
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn node_leave(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let node = self.node_find(rctx, identity, false).await?;
        if node.cluster_id.is_none() {
            return Err(Error::BadRequest(format!(
                "node {identity} is already an orphan node"
            )));
        }

        tracing::info!(node = %identity, "node leaving cluster");
        let action = self
            .submit_action(
                rctx,
                "node_leave",
                node.id,
                ActionInputs::NodeLeave,
                self.ctx.defaults.action_timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }
}
