use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms};

use crate::db;
use crate::models::{ActionKind, Trigger, Webhook, WebhookObjType};
use crate::registry::spec_type_key;

use super::{EngineService, ListRequest, apply_filters, inputs_from_params, to_dicts};

#[derive(Debug, Deserialize)]
pub struct WebhookCreateRequest {
    #[serde(default)]
    pub name: Option<String>,
    pub obj_id: String,
    pub obj_type: String,
    pub action: String,
    #[serde(default)]
    pub credential: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookTriggerRequest {
    pub identity: String,
    #[serde(default)]
    pub params: Option<Value>,
    /// Bearer key from the issued URL; absent for owner/admin calls.
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerCreateRequest {
    pub name: String,
    pub spec: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
}

fn hash_key(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    hex::encode(hasher.finalize())
}

impl EngineService {
    pub async fn webhook_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Webhook> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::webhooks::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::webhooks::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && Uuid::parse_str(identity).is_err() {
            found = db::webhooks::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "webhook",
            id: identity.to_string(),
        })
    }

    pub async fn webhook_list(&self, rctx: &RequestContext, req: ListRequest) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req)?;
        let webhooks = db::webhooks::list(&self.ctx.pool, &list_params).await?;
        Ok(apply_filters(to_dicts(webhooks)?, req.filters.as_ref()))
    }

    pub async fn webhook_create(
        &self,
        rctx: &RequestContext,
        req: WebhookCreateRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let obj_type = WebhookObjType::parse(&req.obj_type.to_lowercase())?;
        let kind = ActionKind::parse(&req.action).map_err(|_| {
            Error::BadRequest(format!("illegal action name '{}' specified", req.action))
        })?;

        // The action must operate on the webhook's object type.
        if kind.obj_prefix() != obj_type.as_str() {
            return Err(Error::BadRequest(format!(
                "action {} is not applicable to objects of type {}",
                kind, obj_type
            )));
        }

        let (obj_id, obj_user) = match obj_type {
            WebhookObjType::Cluster => {
                let c = self.cluster_find(rctx, &req.obj_id, false).await?;
                (c.id, c.user)
            }
            WebhookObjType::Node => {
                let n = self.node_find(rctx, &req.obj_id, false).await?;
                (n.id, n.user)
            }
            WebhookObjType::Policy => {
                let p = self.policy_find(rctx, &req.obj_id, false).await?;
                (p.id, p.user)
            }
        };

        if !rctx.is_admin && rctx.user != obj_user {
            return Err(Error::Forbidden);
        }

        // Persist the caller's delegated credential so later triggers can be
        // replayed as the creator.
        let credential = match req.credential {
            Some(credential) => credential,
            None => json!({"trusts": rctx.trusts.clone().map(|t| vec![t]).unwrap_or_default()}),
        };
        db::credentials::store(pool, &rctx.user, &rctx.project, &credential).await?;

        let key: [u8; 32] = rand::random();
        let now = now_ms();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            name: req.name,
            obj_id,
            obj_type,
            action: kind,
            key_hash: hash_key(&key),
            params: req.params.unwrap_or(json!({})),
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tracing::info!(webhook = %webhook.id, obj = %obj_id, action = %kind, "creating webhook");
        db::webhooks::insert(pool, &webhook).await?;

        // The key is only ever available here, inside the issued URL.
        let token = base64_url::encode(&key);
        let mut result = serde_json::to_value(&webhook).map_err(|e| Error::Internal(e.into()))?;
        result["url"] = json!(format!("/v1/webhooks/{}/trigger?key={token}", webhook.id));
        Ok(result)
    }

    pub async fn webhook_get(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let webhook = self.webhook_find(rctx, identity, false).await?;
        serde_json::to_value(&webhook).map_err(|e| Error::Internal(e.into()))
    }

    /// Verify the bearer key (or owner/admin identity) and synthesize the
    /// webhook's action as its original creator.
    pub async fn webhook_trigger(
        &self,
        rctx: &RequestContext,
        req: WebhookTriggerRequest,
    ) -> Result<Value> {
        let pool = &self.ctx.pool;
        let webhook = self.webhook_find(rctx, &req.identity, false).await?;

        match req.key.as_deref() {
            Some(token) => {
                let key = base64_url::decode(token)
                    .map_err(|_| Error::Forbidden)?;
                if hash_key(&key) != webhook.key_hash {
                    return Err(Error::Forbidden);
                }
            }
            None => {
                if !rctx.is_admin && rctx.user != webhook.user {
                    return Err(Error::Forbidden);
                }
            }
        }

        // Replay as the creator, with any stored delegated credential.
        let credential = db::credentials::get(pool, &webhook.user, &webhook.project).await?;
        let creator = RequestContext {
            user: webhook.user.clone(),
            project: webhook.project.clone(),
            domain: webhook.domain.clone(),
            is_admin: false,
            trusts: credential
                .as_ref()
                .and_then(|c| c["trusts"][0].as_str())
                .map(String::from),
        };

        // The target object must still exist.
        let timeout = match webhook.obj_type {
            WebhookObjType::Cluster => {
                self.cluster_find(&creator, &webhook.obj_id.to_string(), false)
                    .await?
                    .timeout
            }
            WebhookObjType::Node => {
                self.node_find(&creator, &webhook.obj_id.to_string(), false)
                    .await?;
                self.ctx.defaults.action_timeout
            }
            WebhookObjType::Policy => {
                self.policy_find(&creator, &webhook.obj_id.to_string(), false)
                    .await?;
                self.ctx.defaults.action_timeout
            }
        };

        let params = match req.params {
            Some(ref params) if !params.is_null() => params.clone(),
            _ => webhook.params.clone(),
        };
        let inputs = inputs_from_params(webhook.action, &params)?;

        tracing::info!(webhook = %webhook.id, action = %webhook.action, "triggering webhook");
        let action = self
            .submit_action(&creator, "webhook_action", webhook.obj_id, inputs, timeout)
            .await?;
        Ok(json!({"action": action}))
    }

    pub async fn webhook_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let webhook = self.webhook_find(rctx, identity, false).await?;
        tracing::info!(webhook = %identity, "deleting webhook");
        db::webhooks::soft_delete(&self.ctx.pool, webhook.id).await?;
        Ok(Value::Null)
    }

    // ---- triggers ----

    pub async fn trigger_find(
        &self,
        rctx: &RequestContext,
        identity: &str,
        show_deleted: bool,
    ) -> Result<Trigger> {
        let pool = &self.ctx.pool;
        let project = self.scope(rctx);
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::triggers::get(pool, id, show_deleted).await?;
        }
        if found.is_none() {
            found = db::triggers::get_by_name(pool, project.as_deref(), identity).await?;
        }
        if found.is_none() && Uuid::parse_str(identity).is_err() {
            found = db::triggers::get_by_short_id(pool, project.as_deref(), identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "trigger",
            id: identity.to_string(),
        })
    }

    pub async fn trigger_type_list(&self, _rctx: &RequestContext) -> Result<Value> {
        Ok(json!(self.ctx.env.trigger_types()))
    }

    pub async fn trigger_list(&self, rctx: &RequestContext, req: ListRequest) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req)?;
        let triggers = db::triggers::list(&self.ctx.pool, &list_params).await?;
        Ok(apply_filters(to_dicts(triggers)?, req.filters.as_ref()))
    }

    pub async fn trigger_create(
        &self,
        rctx: &RequestContext,
        req: TriggerCreateRequest,
    ) -> Result<Value> {
        let type_key = spec_type_key(&req.spec)?;
        let plugin = self.ctx.env.new_trigger(&type_key, &req.spec)?;
        plugin.validate()?;

        tracing::info!(name = %req.name, type_name = %type_key, "creating trigger");
        let now = now_ms();
        let trigger = Trigger {
            id: Uuid::new_v4(),
            name: req.name,
            type_name: type_key,
            spec: req.spec,
            description: req.description,
            enabled: req.enabled.unwrap_or(true),
            state: req.state.unwrap_or_else(|| "ok".into()),
            severity: req.severity.unwrap_or_else(|| "low".into()),
            user: rctx.user.clone(),
            project: rctx.project.clone(),
            domain: rctx.domain.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::triggers::insert(&self.ctx.pool, &trigger).await?;
        serde_json::to_value(&trigger).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn trigger_get(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let trigger = self.trigger_find(rctx, identity, false).await?;
        serde_json::to_value(&trigger).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn trigger_delete(&self, rctx: &RequestContext, identity: &str) -> Result<Value> {
        let trigger = self.trigger_find(rctx, identity, false).await?;
        tracing::info!(trigger = %identity, "deleting trigger");
        db::triggers::soft_delete(&self.ctx.pool, trigger.id).await?;
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_hash_is_stable_hex_sha256() {
        let key = [7u8; 32];
        let h1 = hash_key(&key);
        let h2 = hash_key(&key);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, hash_key(&[8u8; 32]));
    }

    #[test]
    fn webhook_kind_prefix_rule() {
        // cluster-prefixed kinds fit cluster webhooks, nothing fits policy
        // webhooks since no POLICY_* action kind exists.
        assert_eq!(ActionKind::ClusterScaleOut.obj_prefix(), "cluster");
        assert_eq!(ActionKind::NodeDelete.obj_prefix(), "node");
        for kind in ActionKind::ALL {
            assert_ne!(kind.obj_prefix(), WebhookObjType::Policy.as_str());
        }
    }
}
