use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms};

use crate::db;
use crate::models::Profile;
use crate::registry::spec_type_key;

use super::{EngineService, ListRequest, apply_filters, is_uuid_like, to_dicts};

#[derive(Debug, Deserialize)]
pub struct ProfileCreateRequest {
    pub name: String,
    pub spec: Value,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProfileUpdateRequest {
    pub identity: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub spec: Option<Value>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl EngineService {
    /// Find a profile by name, full UUID, or short UUID.
    pub async fn profile_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Profile> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::profiles::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::profiles::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && !is_uuid_like(identity) {
            found = db::profiles::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "profile",
            id: identity.to_string(),
        })
    }

    pub async fn profile_type_list(&self, _rctx: &RequestContext) -> Result<Value> {
        Ok(json!(self.ctx.env.profile_types()))
    }

    pub async fn profile_type_schema(
        &self,
        _rctx: &RequestContext,
        type_name: &str,
    ) -> Result<Value> {
        let entry = self.ctx.env.profile_entry(type_name)?;
        Ok(json!({"spec": (entry.schema)()}))
    }

    pub async fn profile_list(
        &self,
        rctx: &RequestContext,
        req: ListRequest,
    ) -> Result<Vec<Value>> {
        let params = self.list_params(rctx, &req)?;
        let profiles = db::profiles::list(&self.ctx.pool, &params).await?;
        Ok(apply_filters(to_dicts(profiles)?, req.filters.as_ref()))
    }

    pub async fn profile_create(
        &self,
        rctx: &RequestContext,
        req: ProfileCreateRequest,
    ) -> Result<Value> {
        let type_key = spec_type_key(&req.spec)?;
        let plugin = self.ctx.env.new_profile(&type_key, &req.spec)?;
        plugin.validate()?;

        tracing::info!(name = %req.name, type_name = %type_key, "creating profile");
        let now = now_ms();
        let profile = Profile {
            id: Uuid::new_v4(),
            name: req.name,
            type_name: type_key,
            spec: req.spec,
            permission: req.permission,
            metadata: req.metadata.unwrap_or(json!({})),
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::profiles::insert(&self.ctx.pool, &profile).await?;
        serde_json::to_value(&profile).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn profile_get(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let profile = self.profile_find(rctx, identity, false).await?;
        serde_json::to_value(&profile).map_err(|e| Error::Internal(e.into()))
    }

    /// Name/permission/metadata update in place; a spec change re-validates
    /// and produces a new profile row, since stored specs are immutable.
    pub async fn profile_update(
        &self,
        rctx: &RequestContext,
        req: ProfileUpdateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let old = self.profile_find(rctx, &req.identity, false).await?;

        let Some(spec_patch) = req.spec else {
            let name = req.name.unwrap_or_else(|| old.name.clone());
            let metadata = req.metadata.unwrap_or_else(|| old.metadata.clone());
            let permission = req.permission.or_else(|| old.permission.clone());
            db::profiles::update_properties(
                pool,
                old.id,
                &name,
                permission.as_deref(),
                &metadata,
            )
            .await?;
            return self.profile_get(rctx, &old.id.to_string()).await;
        };

        let mut new_spec = old.spec.clone();
        if let (Some(base), Value::Object(patch)) = (new_spec.as_object_mut(), &spec_patch) {
            for (k, v) in patch {
                base.insert(k.clone(), v.clone());
            }
        }
        let type_key = spec_type_key(&new_spec)?;
        if type_key != old.type_name {
            return Err(Error::BadRequest(
                "a profile spec update may not change its type".into(),
            ));
        }
        let plugin = self.ctx.env.new_profile(&type_key, &new_spec)?;
        plugin.validate()?;

        let now = now_ms();
        let profile = Profile {
            id: Uuid::new_v4(),
            name: req.name.unwrap_or_else(|| old.name.clone()),
            type_name: type_key,
            spec: new_spec,
            permission: req.permission.or_else(|| old.permission.clone()),
            metadata: req.metadata.unwrap_or_else(|| old.metadata.clone()),
            user: old.user.clone(),
            project: old.project.clone(),
            domain: old.domain.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::profiles::insert(pool, &profile).await?;
        serde_json::to_value(&profile).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn profile_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let pool = &self.ctx.pool;
        let profile = self.profile_find(rctx, identity, false).await?;

        let clusters = db::clusters::count_by_profile(pool, profile.id).await?;
        let nodes = db::nodes::count_by_profile(pool, profile.id).await?;
        if clusters > 0 || nodes > 0 {
            return Err(Error::ResourceInUse {
                kind: "profile",
                id: profile.id.to_string(),
            });
        }

        tracing::info!(profile = %identity, "deleting profile");
        db::profiles::soft_delete(pool, profile.id).await?;
        Ok(Value::Null)
    }
}
