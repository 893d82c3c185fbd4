use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms, params};

use crate::db;
use crate::models::{
    ActionInputs, AdjustmentType, Cluster, ClusterStatus, NodeStatus, UNBOUNDED,
};
use crate::scaling;

use super::{EngineService, ListRequest, apply_filters, to_dicts};

#[derive(Debug, Deserialize)]
pub struct ClusterCreateRequest {
    pub name: String,
    #[serde(default)]
    pub desired_capacity: Value,
    pub profile_id: String,
    #[serde(default)]
    pub min_size: Value,
    #[serde(default)]
    pub max_size: Value,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub timeout: Value,
}

#[derive(Debug, Deserialize)]
pub struct ClusterUpdateRequest {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub timeout: Value,
}

#[derive(Debug, Deserialize)]
pub struct ClusterNodesRequest {
    pub identity: String,
    pub nodes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClusterResizeRequest {
    pub identity: String,
    #[serde(default)]
    pub adjustment_type: Option<String>,
    #[serde(default)]
    pub number: Value,
    #[serde(default)]
    pub min_size: Value,
    #[serde(default)]
    pub max_size: Value,
    #[serde(default)]
    pub min_step: Value,
    #[serde(default)]
    pub strict: Value,
}

#[derive(Debug, Deserialize)]
pub struct ClusterScaleRequest {
    pub identity: String,
    #[serde(default)]
    pub count: Value,
}

#[derive(Debug, Deserialize)]
pub struct ClusterPolicyRequest {
    pub identity: String,
    pub policy: String,
    #[serde(default)]
    pub priority: Value,
    #[serde(default)]
    pub level: Value,
    #[serde(default)]
    pub cooldown: Value,
    #[serde(default)]
    pub enabled: Value,
}

impl EngineService {
    pub async fn cluster_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Cluster> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::clusters::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::clusters::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && Uuid::parse_str(identity).is_err() {
            found = db::clusters::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "cluster",
            id: identity.to_string(),
        })
    }

    pub async fn cluster_list(
        &self,
        rctx: &RequestContext,
        req: ListRequest,
    ) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req)?;
        let clusters = db::clusters::list(&self.ctx.pool, &list_params).await?;
        Ok(apply_filters(to_dicts(clusters)?, req.filters.as_ref()))
    }

    pub async fn cluster_get(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let cluster = self.cluster_find(rctx, identity, false).await?;
        serde_json::to_value(&cluster).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn cluster_create(
        &self,
        rctx: &RequestContext,
        req: ClusterCreateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let profile = self.profile_find(rctx, &req.profile_id, false).await?;

        let desired = params::parse_int_param(
            "desired_capacity",
            &req.desired_capacity,
            params::IntRule::default(),
        )?
        .ok_or_else(|| Error::BadRequest("desired_capacity is required".into()))?;
        let min_size = params::parse_int_param("min_size", &req.min_size, params::IntRule::default())?;
        let max_size = params::parse_int_param(
            "max_size",
            &req.max_size,
            params::IntRule::default().negative_ok(),
        )?;
        scaling::validate_size_params(Some(desired), min_size, max_size)?;
        let timeout = params::parse_int_param("timeout", &req.timeout, params::IntRule::default())?
            .unwrap_or(self.ctx.defaults.action_timeout);

        if db::clusters::get_by_name(pool, Some(&rctx.project), &req.name)
            .await?
            .is_some()
        {
            return Err(Error::BadRequest(format!(
                "a cluster named '{}' already exists",
                req.name
            )));
        }

        let parent = match req.parent.as_deref() {
            Some(parent) => Some(self.cluster_find(rctx, parent, false).await?.id),
            None => None,
        };

        tracing::info!(name = %req.name, desired, "creating cluster");
        let now = now_ms();
        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: req.name,
            profile_id: profile.id,
            parent,
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            desired_capacity: desired as i32,
            min_size: min_size.unwrap_or(0) as i32,
            max_size: max_size.unwrap_or(UNBOUNDED as i64) as i32,
            timeout,
            status: ClusterStatus::Init,
            status_reason: "initializing".into(),
            metadata: req.metadata.unwrap_or(json!({})),
            data: json!({}),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::clusters::insert(pool, &cluster).await?;

        let action = self
            .submit_action(
                rctx,
                "cluster_create",
                cluster.id,
                ActionInputs::ClusterCreate,
                timeout,
            )
            .await?;

        let mut result = serde_json::to_value(&cluster).map_err(|e| Error::Internal(e.into()))?;
        result["action"] = json!(action);
        Ok(result)
    }

    /// Property changes apply synchronously; a profile change needs the
    /// cluster lock and therefore goes through an action.
    pub async fn cluster_update(
        &self,
        rctx: &RequestContext,
        req: ClusterUpdateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let mut cluster = self.cluster_find(rctx, &req.identity, false).await?;

        let mut changed = false;
        if let Some(ref name) = req.name
            && *name != cluster.name
        {
            cluster.name = name.clone();
            changed = true;
        }
        if let Some(ref parent) = req.parent {
            let parent_id = self.cluster_find(rctx, parent, false).await?.id;
            if cluster.parent != Some(parent_id) {
                cluster.parent = Some(parent_id);
                changed = true;
            }
        }
        if let Some(ref metadata) = req.metadata {
            let mut merged = cluster.metadata.clone();
            if let (Some(base), Value::Object(patch)) = (merged.as_object_mut(), metadata) {
                for (k, v) in patch {
                    base.insert(k.clone(), v.clone());
                }
            }
            if merged != cluster.metadata {
                cluster.metadata = merged;
                changed = true;
            }
        }
        if let Some(timeout) =
            params::parse_int_param("timeout", &req.timeout, params::IntRule::default())?
            && timeout != cluster.timeout
        {
            cluster.timeout = timeout;
            changed = true;
        }

        let new_profile = match req.profile_id.as_deref() {
            Some(profile_identity) => {
                let new_profile = self.profile_find(rctx, profile_identity, false).await?;
                if new_profile.id == cluster.profile_id {
                    None
                } else {
                    Some(new_profile)
                }
            }
            None => None,
        };

        let Some(new_profile) = new_profile else {
            if changed {
                db::clusters::update(pool, &cluster).await?;
            }
            return serde_json::to_value(&cluster).map_err(|e| Error::Internal(e.into()));
        };

        if cluster.status == ClusterStatus::Error {
            return Err(Error::FeatureNotSupported(
                "cannot update a cluster when it is in error state".into(),
            ));
        }
        let old_profile = db::profiles::get(pool, cluster.profile_id, true)
            .await?
            .ok_or(Error::NotFound {
                kind: "profile",
                id: cluster.profile_id.to_string(),
            })?;
        if new_profile.type_name != old_profile.type_name {
            return Err(Error::ProfileTypeNotMatch(
                "cannot update a cluster to a different profile type".into(),
            ));
        }

        tracing::info!(cluster = %req.identity, profile = %new_profile.id, "updating cluster profile");
        let action = self
            .submit_action(
                rctx,
                "cluster_update",
                cluster.id,
                ActionInputs::ClusterUpdate {
                    new_profile_id: new_profile.id,
                },
                cluster.timeout,
            )
            .await?;
        if changed {
            db::clusters::update(pool, &cluster).await?;
        }

        let mut result = serde_json::to_value(&cluster).map_err(|e| Error::Internal(e.into()))?;
        result["action"] = json!(action);
        Ok(result)
    }

    pub async fn cluster_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let cluster = self.cluster_find(rctx, identity, false).await?;

        let bindings = db::policies::bindings_for_cluster(&self.ctx.pool, cluster.id).await?;
        if !bindings.is_empty() {
            return Err(Error::BadRequest(format!(
                "cluster {identity} cannot be deleted without detaching all policies"
            )));
        }

        tracing::info!(cluster = %identity, "deleting cluster");
        let action = self
            .submit_action(
                rctx,
                "cluster_delete",
                cluster.id,
                ActionInputs::ClusterDelete,
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_add_nodes(
        &self,
        rctx: &RequestContext,
        req: ClusterNodesRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        let cluster_profile = db::profiles::get(pool, cluster.profile_id, true)
            .await?
            .ok_or(Error::NotFound {
                kind: "profile",
                id: cluster.profile_id.to_string(),
            })?;

        let mut found = vec![];
        let mut not_found = vec![];
        let mut bad_nodes = vec![];
        let mut owned_nodes = vec![];
        let mut type_mismatch = vec![];
        for identity in &req.nodes {
            let node = match self.node_find(rctx, identity, false).await {
                Ok(node) => node,
                Err(Error::NotFound { .. }) => {
                    not_found.push(identity.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            if node.status != NodeStatus::Active {
                bad_nodes.push(node.id);
            } else if node.cluster_id.is_some() {
                owned_nodes.push(identity.clone());
            } else {
                let node_profile = db::profiles::get(pool, node.profile_id, true)
                    .await?
                    .ok_or(Error::NotFound {
                        kind: "profile",
                        id: node.profile_id.to_string(),
                    })?;
                if node_profile.type_name != cluster_profile.type_name {
                    type_mismatch.push(node.id);
                } else {
                    found.push(node.id);
                }
            }
        }

        if !type_mismatch.is_empty() {
            return Err(Error::ProfileTypeNotMatch(format!(
                "profile type of nodes {type_mismatch:?} does not match the cluster"
            )));
        }
        if !owned_nodes.is_empty() {
            return Err(Error::NodeNotOrphan(format!(
                "nodes {owned_nodes:?} are owned by other clusters; remove them from those clusters first"
            )));
        }
        if !bad_nodes.is_empty() {
            return Err(Error::BadRequest(format!("nodes are not ACTIVE: {bad_nodes:?}")));
        }
        if !not_found.is_empty() {
            return Err(Error::BadRequest(format!("nodes not found: {not_found:?}")));
        }
        if found.is_empty() {
            return Err(Error::BadRequest("no nodes to add".into()));
        }

        let action = self
            .submit_action(
                rctx,
                "cluster_add_nodes",
                cluster.id,
                ActionInputs::ClusterAddNodes { nodes: found },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_del_nodes(
        &self,
        rctx: &RequestContext,
        req: ClusterNodesRequest,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;

        let mut found = vec![];
        let mut not_found = vec![];
        let mut bad_nodes = vec![];
        for identity in &req.nodes {
            let node = match self.node_find(rctx, identity, false).await {
                Ok(node) => node,
                Err(Error::NotFound { .. }) => {
                    not_found.push(identity.clone());
                    continue;
                }
                Err(e) => return Err(e),
            };
            if node.cluster_id != Some(cluster.id) {
                bad_nodes.push(node.id);
            } else {
                found.push(node.id);
            }
        }

        if !not_found.is_empty() {
            return Err(Error::BadRequest(format!("nodes not found: {not_found:?}")));
        }
        if !bad_nodes.is_empty() {
            return Err(Error::BadRequest(format!(
                "nodes not members of the specified cluster: {bad_nodes:?}"
            )));
        }
        if found.is_empty() {
            return Err(Error::BadRequest("no nodes specified".into()));
        }

        let action = self
            .submit_action(
                rctx,
                "cluster_del_nodes",
                cluster.id,
                ActionInputs::ClusterDelNodes { nodes: found },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_resize(
        &self,
        rctx: &RequestContext,
        req: ClusterResizeRequest,
    ) -> Result<Value> {
        let adj_type = req
            .adjustment_type
            .as_deref()
            .map(AdjustmentType::parse)
            .transpose()?;

        let number = match adj_type {
            None => {
                if !req.number.is_null() {
                    return Err(Error::BadRequest(
                        "missing adjustment_type value for size adjustment".into(),
                    ));
                }
                None
            }
            Some(adj) => {
                if req.number.is_null() {
                    return Err(Error::BadRequest(
                        "missing number value for size adjustment".into(),
                    ));
                }
                // EXACT_CAPACITY wants an unsigned int, CHANGE_IN_CAPACITY a
                // signed one, CHANGE_IN_PERCENTAGE a float.
                let number = match adj {
                    AdjustmentType::ExactCapacity => params::parse_int_param(
                        "number",
                        &req.number,
                        params::IntRule::default(),
                    )?
                    .map(|n| n as f64),
                    AdjustmentType::ChangeInCapacity => params::parse_int_param(
                        "number",
                        &req.number,
                        params::IntRule::default().negative_ok(),
                    )?
                    .map(|n| n as f64),
                    AdjustmentType::ChangeInPercentage => {
                        params::parse_float_param("number", &req.number)?
                    }
                };
                number
            }
        };

        let min_size =
            params::parse_int_param("min_size", &req.min_size, params::IntRule::default())?;
        let max_size = params::parse_int_param(
            "max_size",
            &req.max_size,
            params::IntRule::default().negative_ok(),
        )?;
        scaling::validate_size_params(None, min_size, max_size)?;
        let min_step = if adj_type == Some(AdjustmentType::ChangeInPercentage) {
            params::parse_int_param("min_step", &req.min_step, params::IntRule::default())?
        } else {
            None
        };
        let strict = params::parse_bool_param("strict", &req.strict)?.unwrap_or(true);

        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        tracing::info!(
            cluster = %req.identity,
            adjustment = ?adj_type,
            number = ?number,
            strict,
            "resizing cluster"
        );

        let action = self
            .submit_action(
                rctx,
                "cluster_resize",
                cluster.id,
                ActionInputs::ClusterResize {
                    adj_type,
                    number,
                    min_size: min_size.map(|v| v as i32),
                    max_size: max_size.map(|v| v as i32),
                    min_step: min_step.map(|v| v as i32),
                    strict,
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_scale_out(
        &self,
        rctx: &RequestContext,
        req: ClusterScaleRequest,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        let count =
            params::parse_int_param("count", &req.count, params::IntRule::default().nonzero())?;
        if let Some(count) = count {
            tracing::info!(cluster = %req.identity, count, "scaling out cluster");
        }
        let action = self
            .submit_action(
                rctx,
                "cluster_scale_out",
                cluster.id,
                ActionInputs::ClusterScaleOut {
                    count: count.map(|c| c as i32),
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_scale_in(
        &self,
        rctx: &RequestContext,
        req: ClusterScaleRequest,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        let count =
            params::parse_int_param("count", &req.count, params::IntRule::default().nonzero())?;
        if let Some(count) = count {
            tracing::info!(cluster = %req.identity, count, "scaling in cluster");
        }
        let action = self
            .submit_action(
                rctx,
                "cluster_scale_in",
                cluster.id,
                ActionInputs::ClusterScaleIn {
                    count: count.map(|c| c as i32),
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_policy_list(
        &self,
        rctx: &RequestContext,
        identity: &str,
    ) -> Result<Vec<Value>> {
        let cluster = self.cluster_find(rctx, identity, false).await?;
        let bindings = db::policies::bindings_for_cluster(&self.ctx.pool, cluster.id).await?;
        to_dicts(bindings)
    }

    pub async fn cluster_policy_get(
        &self,
        rctx: &RequestContext,
        identity: &str,
        policy: &str,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, identity, false).await?;
        let policy_row = self.policy_find(rctx, policy, false).await?;
        let binding = db::policies::binding_get(&self.ctx.pool, cluster.id, policy_row.id)
            .await?
            .ok_or_else(|| Error::PolicyBindingNotFound {
                policy: policy.to_string(),
                cluster: identity.to_string(),
            })?;
        serde_json::to_value(&binding).map_err(|e| Error::Internal(e.into()))
    }

    /// Attachment goes through an action because it needs the cluster lock.
    pub async fn cluster_policy_attach(
        &self,
        rctx: &RequestContext,
        req: ClusterPolicyRequest,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        let policy = self.policy_find(rctx, &req.policy, false).await?;

        let priority =
            params::parse_int_param("priority", &req.priority, params::IntRule::default())?
                .map(|v| v as i32)
                .unwrap_or(self.ctx.defaults.policy_priority);
        let level =
            params::parse_int_param("level", &req.level, params::IntRule::default().at_most(100))?
                .map(|v| v as i32)
                .unwrap_or(policy.level);
        let cooldown =
            params::parse_int_param("cooldown", &req.cooldown, params::IntRule::default())?
                .unwrap_or(policy.cooldown);
        // An explicit enabled=false is honored as given.
        let enabled = params::parse_bool_param("enabled", &req.enabled)?.unwrap_or(true);

        tracing::info!(policy = %req.policy, cluster = %req.identity, "attaching policy");
        let action = self
            .submit_action(
                rctx,
                "attach_policy",
                cluster.id,
                ActionInputs::ClusterAttachPolicy {
                    policy_id: policy.id,
                    priority,
                    level,
                    cooldown,
                    enabled,
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_policy_detach(
        &self,
        rctx: &RequestContext,
        identity: &str,
        policy: &str,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, identity, false).await?;
        let policy_row = self.policy_find(rctx, policy, false).await?;
        if db::policies::binding_get(&self.ctx.pool, cluster.id, policy_row.id)
            .await?
            .is_none()
        {
            return Err(Error::PolicyBindingNotFound {
                policy: policy.to_string(),
                cluster: identity.to_string(),
            });
        }

        tracing::info!(policy = %policy, cluster = %identity, "detaching policy");
        let action = self
            .submit_action(
                rctx,
                "detach_policy",
                cluster.id,
                ActionInputs::ClusterDetachPolicy {
                    policy_id: policy_row.id,
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn cluster_policy_update(
        &self,
        rctx: &RequestContext,
        req: ClusterPolicyRequest,
    ) -> Result<Value> {
        let cluster = self.cluster_find(rctx, &req.identity, false).await?;
        let policy = self.policy_find(rctx, &req.policy, false).await?;
        if db::policies::binding_get(&self.ctx.pool, cluster.id, policy.id)
            .await?
            .is_none()
        {
            return Err(Error::PolicyBindingNotFound {
                policy: req.policy.clone(),
                cluster: req.identity.clone(),
            });
        }

        let priority =
            params::parse_int_param("priority", &req.priority, params::IntRule::default())?
                .map(|v| v as i32);
        let level =
            params::parse_int_param("level", &req.level, params::IntRule::default().at_most(100))?
                .map(|v| v as i32);
        let cooldown =
            params::parse_int_param("cooldown", &req.cooldown, params::IntRule::default())?;
        let enabled = params::parse_bool_param("enabled", &req.enabled)?;

        tracing::info!(policy = %req.policy, cluster = %req.identity, "updating policy binding");
        let action = self
            .submit_action(
                rctx,
                "update_policy",
                cluster.id,
                ActionInputs::ClusterUpdatePolicy {
                    policy_id: policy.id,
                    priority,
                    level,
                    cooldown,
                    enabled,
                },
                cluster.timeout,
            )
            .await?;
        Ok(json!({"action": action}))
    }
}
