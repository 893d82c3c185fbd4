use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms, params};

use crate::db;
use crate::models::Policy;
use crate::registry::spec_type_key;

use super::{EngineService, ListRequest, apply_filters, is_uuid_like, to_dicts};

/// Enforcement level applied when the client does not pick one.
const DEFAULT_LEVEL: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct PolicyCreateRequest {
    pub name: String,
    pub spec: Value,
    #[serde(default)]
    pub level: Value,
    #[serde(default)]
    pub cooldown: Value,
}

#[derive(Debug, Deserialize)]
pub struct PolicyUpdateRequest {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub level: Value,
    #[serde(default)]
    pub cooldown: Value,
}

impl EngineService {
    pub async fn policy_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Policy> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::policies::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::policies::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && !is_uuid_like(identity) {
            found = db::policies::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "policy",
            id: identity.to_string(),
        })
    }

    pub async fn policy_type_list(&self, _rctx: &RequestContext) -> Result<Value> {
        Ok(json!(self.ctx.env.policy_types()))
    }

    pub async fn policy_type_schema(
        &self,
        _rctx: &RequestContext,
        type_name: &str,
    ) -> Result<Value> {
        let entry = self.ctx.env.policy_entry(type_name)?;
        Ok(json!({"spec": (entry.schema)()}))
    }

    pub async fn policy_list(&self, rctx: &RequestContext, req: ListRequest) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req)?;
        let policies = db::policies::list(&self.ctx.pool, &list_params).await?;
        Ok(apply_filters(to_dicts(policies)?, req.filters.as_ref()))
    }

    pub async fn policy_create(
        &self,
        rctx: &RequestContext,
        req: PolicyCreateRequest,
    ) -> Result<Value> {
        let level = params::parse_int_param("level", &req.level, params::IntRule::default().at_most(100))?
            .unwrap_or(DEFAULT_LEVEL);
        let cooldown =
            params::parse_int_param("cooldown", &req.cooldown, params::IntRule::default())?
                .unwrap_or(0);

        let type_key = spec_type_key(&req.spec)?;
        tracing::info!(name = %req.name, type_name = %type_key, "creating policy");

        let now = now_ms();
        let policy = Policy {
            id: Uuid::new_v4(),
            name: req.name,
            type_name: type_key,
            spec: req.spec,
            level: level as i32,
            cooldown,
            data: json!({}),
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let plugin = self.ctx.env.new_policy(&policy)?;
        plugin.validate(&self.ctx, false).await?;

        db::policies::insert(&self.ctx.pool, &policy).await?;
        serde_json::to_value(&policy).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn policy_get(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let policy = self.policy_find(rctx, identity, false).await?;
        serde_json::to_value(&policy).map_err(|e| Error::Internal(e.into()))
    }

    /// Spec is immutable by contract; only name, level and cooldown move.
    pub async fn policy_update(
        &self,
        rctx: &RequestContext,
        req: PolicyUpdateRequest,
    ) -> Result<Value> {
        let policy = self.policy_find(rctx, &req.identity, false).await?;
        let level =
            params::parse_int_param("level", &req.level, params::IntRule::default().at_most(100))?
                .map(|l| l as i32)
                .unwrap_or(policy.level);
        let cooldown =
            params::parse_int_param("cooldown", &req.cooldown, params::IntRule::default())?
                .unwrap_or(policy.cooldown);
        let name = req.name.unwrap_or_else(|| policy.name.clone());

        db::policies::update_properties(&self.ctx.pool, policy.id, &name, level, cooldown).await?;
        self.policy_get(rctx, &policy.id.to_string()).await
    }

    pub async fn policy_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let policy = self.policy_find(rctx, identity, false).await?;
        let bindings = db::policies::bindings_for_policy(&self.ctx.pool, policy.id).await?;
        if !bindings.is_empty() {
            return Err(Error::ResourceInUse {
                kind: "policy",
                id: policy.id.to_string(),
            });
        }
        tracing::info!(policy = %identity, "deleting policy");
        db::policies::soft_delete(&self.ctx.pool, policy.id).await?;
        Ok(Value::Null)
    }
}
