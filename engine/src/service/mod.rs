//! Service façade: the only component clients address. Every mutating
//! intent is validated, resolved against the store, persisted, and turned
//! into an action handed to the dispatcher; reads return projections
//! synchronously.

pub mod actions;
pub mod clusters;
pub mod nodes;
pub mod policies;
pub mod profiles;
pub mod webhooks;

use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use drover_common::{Error, RequestContext, Result, now_ms, params};

use crate::context::EngineContext;
use crate::db::{self, ListParams, SortKey};
use crate::models::{
    Action, ActionCause, ActionInputs, ActionKind, ActionStatus, EventLevel, short_id,
};

pub struct EngineService {
    pub ctx: EngineContext,
}

/// The list-query shape every `*_list` method accepts.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub limit: Value,
    #[serde(default)]
    pub marker: Option<Uuid>,
    #[serde(default)]
    pub sort_keys: Option<String>,
    #[serde(default)]
    pub sort_dir: Option<String>,
    #[serde(default)]
    pub filters: Option<Value>,
    #[serde(default)]
    pub project_safe: Value,
    #[serde(default)]
    pub show_deleted: Value,
}

impl EngineService {
    pub fn new(ctx: EngineContext) -> Self {
        EngineService { ctx }
    }

    /// Project scope for lookups: admins see everything, everyone else is
    /// confined to their own project.
    pub(crate) fn scope(&self, rctx: &RequestContext) -> Option<String> {
        if rctx.is_admin {
            None
        } else {
            Some(rctx.project.clone())
        }
    }

    pub(crate) fn list_params(
        &self,
        rctx: &RequestContext,
        req: &ListRequest,
    ) -> Result<ListParams> {
        let limit = params::parse_int_param("limit", &req.limit, params::IntRule::default())?;
        let show_deleted = params::parse_bool_param("show_deleted", &req.show_deleted)?
            .unwrap_or(false);
        let project_safe = params::parse_bool_param("project_safe", &req.project_safe)?
            .unwrap_or(true);

        let sort_key = req
            .sort_keys
            .as_deref()
            .and_then(|keys| keys.split(',').find_map(SortKey::parse))
            .unwrap_or(SortKey::CreatedAt);
        let descending = matches!(req.sort_dir.as_deref(), Some("desc"));

        // Only admins may drop project scoping.
        let project = if !project_safe && rctx.is_admin {
            None
        } else {
            Some(rctx.project.clone())
        };

        Ok(ListParams {
            limit,
            marker: req.marker,
            sort_key,
            descending,
            project,
            show_deleted,
        })
    }

    /// Persist an RPC-caused action in READY state and wake the dispatcher.
    pub(crate) async fn submit_action(
        &self,
        rctx: &RequestContext,
        prefix: &str,
        target: Uuid,
        inputs: ActionInputs,
        timeout: i64,
    ) -> Result<Uuid> {
        let now = now_ms();
        let id = Uuid::new_v4();
        let kind = inputs.kind();
        let action = Action {
            id,
            name: format!("{prefix}_{}", short_id(&target)),
            target,
            kind,
            cause: ActionCause::Rpc,
            owner: None,
            start_time: None,
            end_time: None,
            timeout,
            status: ActionStatus::Ready,
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
        db::actions::insert(&self.ctx.pool, &action, &[]).await?;
        db::events::record(
            &self.ctx.pool,
            EventLevel::Info,
            target,
            kind.obj_prefix().to_uppercase().as_str(),
            &action.name,
            Some(kind.as_str()),
            ActionStatus::Ready.as_str(),
            "action accepted",
            &rctx.user,
            &rctx.project,
        )
        .await?;
        self.ctx.notify_dispatcher();
        Ok(id)
    }
}

/// True when the identity looks like a full UUID.
pub(crate) fn is_uuid_like(identity: &str) -> bool {
    Uuid::parse_str(identity).is_ok()
}

/// Build typed action inputs for a webhook- or client-supplied kind from a
/// loose parameter map.
pub(crate) fn inputs_from_params(kind: ActionKind, params: &Value) -> Result<ActionInputs> {
    let mut body = match params {
        Value::Null => serde_json::Map::new(),
        Value::Object(map) => map.clone(),
        _ => {
            return Err(Error::BadRequest(
                "action parameters must be an object".into(),
            ));
        }
    };
    body.insert("action".into(), json!(kind.as_str()));
    serde_json::from_value(Value::Object(body))
        .map_err(|e| Error::BadRequest(format!("invalid parameters for {kind}: {e}")))
}

/// In-memory equality filtering over serialized projections, applied after
/// the store query.
pub(crate) fn apply_filters(items: Vec<Value>, filters: Option<&Value>) -> Vec<Value> {
    let Some(Value::Object(wanted)) = filters else {
        return items;
    };
    items
        .into_iter()
        .filter(|item| wanted.iter().all(|(k, v)| item.get(k) == Some(v)))
        .collect()
}

pub(crate) fn to_dicts<T: serde::Serialize>(items: Vec<T>) -> Result<Vec<Value>> {
    items
        .into_iter()
        .map(|item| serde_json::to_value(item).map_err(|e| Error::Internal(e.into())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_detection() {
        assert!(is_uuid_like("0d53ff52-bbd8-40ce-8671-d648837c0d02"));
        assert!(!is_uuid_like("my-cluster"));
        assert!(!is_uuid_like("0d53ff52"));
    }

    #[test]
    fn inputs_from_params_builds_tagged_payloads() {
        let inputs =
            inputs_from_params(ActionKind::ClusterScaleOut, &json!({"count": 2})).unwrap();
        assert_eq!(inputs, ActionInputs::ClusterScaleOut { count: Some(2) });

        let inputs = inputs_from_params(ActionKind::ClusterScaleIn, &Value::Null).unwrap();
        assert_eq!(inputs, ActionInputs::ClusterScaleIn { count: None });
    }

    #[test]
    fn inputs_from_params_rejects_missing_required_fields() {
        assert!(inputs_from_params(ActionKind::NodeJoin, &json!({})).is_err());
        assert!(inputs_from_params(ActionKind::ClusterAddNodes, &json!("nope")).is_err());
    }

    #[test]
    fn filters_match_on_equality() {
        let items = vec![
            json!({"name": "a", "status": "ACTIVE"}),
            json!({"name": "b", "status": "ERROR"}),
        ];
        let filtered = apply_filters(items.clone(), Some(&json!({"status": "ACTIVE"})));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["name"], "a");
        assert_eq!(apply_filters(items, None).len(), 2);
    }
}
