//! Action and event read/submit surface: list, get, generic derived-action
//! creation with explicit dependencies, and guarded deletion.

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms};

use crate::db;
use crate::models::{
    Action, ActionCause, ActionKind, ActionStatus, Event, short_id,
};

use super::{EngineService, ListRequest, apply_filters, inputs_from_params, to_dicts};

#[derive(Debug, Deserialize)]
pub struct ActionCreateRequest {
    pub name: String,
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub inputs: Option<Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventListRequest {
    #[serde(flatten)]
    pub list: ListRequest,
    #[serde(default)]
    pub obj_id: Option<Uuid>,
}

impl EngineService {
    pub async fn action_find(&self, identity: &str) -> Result<Action> {
        let pool = &self.ctx.pool;
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::actions::get(pool, id).await?;
        }
        if found.is_none() {
            found = db::actions::get_by_name(pool, identity).await?;
        }
        if found.is_none() && Uuid::parse_str(identity).is_err() {
            found = db::actions::get_by_short_id(pool, identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "action",
            id: identity.to_string(),
        })
    }

    pub async fn action_list(&self, rctx: &RequestContext, req: ListRequest) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req)?;
        let actions = db::actions::list(&self.ctx.pool, &list_params).await?;
        Ok(apply_filters(to_dicts(actions)?, req.filters.as_ref()))
    }

    pub async fn action_get(&self, _rctx: &RequestContext, identity: &str) -> Result<Value> {
        let action = self.action_find(identity).await?;
        serde_json::to_value(&action).map_err(|e| Error::Internal(e.into()))
    }

    /// Submit a free-form action against a cluster or node, optionally gated
    /// on other actions. Gated actions park in WAITING until dependency
    /// resolution wakes them.
    pub async fn action_create(
        &self,
        rctx: &RequestContext,
        req: ActionCreateRequest,
    ) -> Result<Value> {
        let kind = ActionKind::parse(&req.action)
            .map_err(|_| Error::BadRequest(format!("illegal action name '{}'", req.action)))?;

        let target = if kind.is_cluster_kind() {
            self.cluster_find(rctx, &req.target, false).await?.id
        } else {
            self.node_find(rctx, &req.target, false).await?.id
        };
        let inputs = inputs_from_params(kind, req.inputs.as_ref().unwrap_or(&Value::Null))?;

        let mut depends_on = Vec::with_capacity(req.depends_on.len());
        for dep in &req.depends_on {
            depends_on.push(self.action_find(dep).await?.id);
        }

        tracing::info!(name = %req.name, action = %kind, "creating action");
        let now = now_ms();
        let id = Uuid::new_v4();
        let action = Action {
            id,
            name: req.name,
            target,
            kind,
            cause: ActionCause::Derived,
            owner: None,
            start_time: None,
            end_time: None,
            timeout: self.ctx.defaults.action_timeout,
            status: if depends_on.is_empty() {
                ActionStatus::Ready
            } else {
                ActionStatus::Waiting
            },
            status_reason: String::new(),
            signal: None,
            inputs,
            outputs: json!({}),
            data: Default::default(),
            attempts: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        db::actions::insert(&self.ctx.pool, &action, &depends_on).await?;
        self.ctx.notify_dispatcher();
        serde_json::to_value(&action).map_err(|e| Error::Internal(e.into()))
    }

    pub async fn action_delete(&self, _rctx: &RequestContext, identity: &str) -> Result<Value> {
        let action = self.action_find(identity).await?;
        if !action.status.is_terminal() {
            return Err(Error::ResourceBusy {
                kind: "action",
                id: short_id(&action.id),
            });
        }
        tracing::info!(action = %identity, "deleting action");
        db::actions::soft_delete(&self.ctx.pool, action.id).await?;
        Ok(Value::Null)
    }

    // ---- events ----

    pub async fn event_find(&self, identity: &str) -> Result<Event> {
        let pool = &self.ctx.pool;
        let mut found = None;
        if let Ok(id) = Uuid::parse_str(identity) {
            found = db::events::get(pool, id).await?;
        }
        if found.is_none() {
            found = db::events::get_by_short_id(pool, identity).await?;
        }
        found.ok_or(Error::NotFound {
            kind: "event",
            id: identity.to_string(),
        })
    }

    pub async fn event_list(
        &self,
        rctx: &RequestContext,
        req: EventListRequest,
    ) -> Result<Vec<Value>> {
        let list_params = self.list_params(rctx, &req.list)?;
        let events = db::events::list(&self.ctx.pool, &list_params, req.obj_id).await?;
        Ok(apply_filters(to_dicts(events)?, req.list.filters.as_ref()))
    }

    pub async fn event_get(&self, _rctx: &RequestContext, identity: &str) -> Result<Value> {
        let event = self.event_find(identity).await?;
        serde_json::to_value(&event).map_err(|e| Error::Internal(e.into()))
    }
}
