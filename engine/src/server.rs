//! HTTP front door. The transport stays thin: one POST route per RPC method
//! name, resolved through a method table into the service façade, plus the
//! opaque webhook-trigger URL that `webhook_create` hands out.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};

use drover_common::{Error, RequestContext, Result};

use crate::service::actions::{ActionCreateRequest, EventListRequest};
use crate::service::clusters::{
    ClusterCreateRequest, ClusterNodesRequest, ClusterPolicyRequest, ClusterResizeRequest,
    ClusterScaleRequest, ClusterUpdateRequest,
};
use crate::service::nodes::{NodeCreateRequest, NodeListRequest, NodeUpdateRequest};
use crate::service::policies::{PolicyCreateRequest, PolicyUpdateRequest};
use crate::service::profiles::{ProfileCreateRequest, ProfileUpdateRequest};
use crate::service::webhooks::{TriggerCreateRequest, WebhookCreateRequest, WebhookTriggerRequest};
use crate::service::{EngineService, ListRequest};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<EngineService>,
}

pub fn router(service: Arc<EngineService>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/rpc/{method}", post(rpc))
        .route("/v1/webhooks/{id}/trigger", post(webhook_trigger))
        .with_state(AppState { service })
}

async fn rpc(
    State(state): State<AppState>,
    rctx: RequestContext,
    Path(method): Path<String>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, Error> {
    let params = body.map(|Json(v)| v).unwrap_or_else(|| json!({}));
    let result = invoke(&state.service, &rctx, &method, params).await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
struct TriggerQuery {
    #[serde(default)]
    key: Option<String>,
}

async fn webhook_trigger(
    State(state): State<AppState>,
    rctx: RequestContext,
    Path(id): Path<String>,
    Query(query): Query<TriggerQuery>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let params = body.map(|Json(v)| v);
    state
        .service
        .webhook_trigger(
            &rctx,
            WebhookTriggerRequest {
                identity: id,
                params,
                key: query.key,
            },
        )
        .await
        .map(Json)
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::BadRequest(format!("invalid parameters for {method}: {e}")))
}

#[derive(Deserialize)]
struct IdentityRequest {
    identity: String,
}

#[derive(Deserialize)]
struct TypeNameRequest {
    type_name: String,
}

#[derive(Deserialize)]
struct NodeGetRequest {
    identity: String,
    #[serde(default)]
    show_details: bool,
}

#[derive(Deserialize)]
struct NodeJoinRequest {
    identity: String,
    cluster_id: String,
}

#[derive(Deserialize)]
struct BindingRequest {
    identity: String,
    policy: String,
}

/// The RPC method table. Method names are the wire contract; anything not
/// listed here does not exist as far as clients are concerned.
pub async fn invoke(
    service: &EngineService,
    rctx: &RequestContext,
    method: &str,
    params: Value,
) -> Result<Value> {
    match method {
        // profiles
        "profile_type_list" => service.profile_type_list(rctx).await,
        "profile_type_schema" => {
            let req: TypeNameRequest = parse(method, params)?;
            service.profile_type_schema(rctx, &req.type_name).await
        }
        "profile_list" => Ok(json!(
            service.profile_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "profile_create" => {
            service
                .profile_create(rctx, parse::<ProfileCreateRequest>(method, params)?)
                .await
        }
        "profile_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.profile_get(rctx, &req.identity).await
        }
        "profile_update" => {
            service
                .profile_update(rctx, parse::<ProfileUpdateRequest>(method, params)?)
                .await
        }
        "profile_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.profile_delete(rctx, &req.identity).await
        }

        // policies
        "policy_type_list" => service.policy_type_list(rctx).await,
        "policy_type_schema" => {
            let req: TypeNameRequest = parse(method, params)?;
            service.policy_type_schema(rctx, &req.type_name).await
        }
        "policy_list" => Ok(json!(
            service.policy_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "policy_create" => {
            service
                .policy_create(rctx, parse::<PolicyCreateRequest>(method, params)?)
                .await
        }
        "policy_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.policy_get(rctx, &req.identity).await
        }
        "policy_update" => {
            service
                .policy_update(rctx, parse::<PolicyUpdateRequest>(method, params)?)
                .await
        }
        "policy_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.policy_delete(rctx, &req.identity).await
        }

        // clusters
        "cluster_list" => Ok(json!(
            service.cluster_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "cluster_create" => {
            service
                .cluster_create(rctx, parse::<ClusterCreateRequest>(method, params)?)
                .await
        }
        "cluster_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.cluster_get(rctx, &req.identity).await
        }
        "cluster_update" => {
            service
                .cluster_update(rctx, parse::<ClusterUpdateRequest>(method, params)?)
                .await
        }
        "cluster_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.cluster_delete(rctx, &req.identity).await
        }
        "cluster_add_nodes" => {
            service
                .cluster_add_nodes(rctx, parse::<ClusterNodesRequest>(method, params)?)
                .await
        }
        "cluster_del_nodes" => {
            service
                .cluster_del_nodes(rctx, parse::<ClusterNodesRequest>(method, params)?)
                .await
        }
        "cluster_resize" => {
            service
                .cluster_resize(rctx, parse::<ClusterResizeRequest>(method, params)?)
                .await
        }
        "cluster_scale_in" => {
            service
                .cluster_scale_in(rctx, parse::<ClusterScaleRequest>(method, params)?)
                .await
        }
        "cluster_scale_out" => {
            service
                .cluster_scale_out(rctx, parse::<ClusterScaleRequest>(method, params)?)
                .await
        }

        // cluster-policy bindings
        "cluster_policy_list" => {
            let req: IdentityRequest = parse(method, params)?;
            Ok(json!(service.cluster_policy_list(rctx, &req.identity).await?))
        }
        "cluster_policy_get" => {
            let req: BindingRequest = parse(method, params)?;
            service.cluster_policy_get(rctx, &req.identity, &req.policy).await
        }
        "cluster_policy_attach" => {
            service
                .cluster_policy_attach(rctx, parse::<ClusterPolicyRequest>(method, params)?)
                .await
        }
        "cluster_policy_detach" => {
            let req: BindingRequest = parse(method, params)?;
            service
                .cluster_policy_detach(rctx, &req.identity, &req.policy)
                .await
        }
        "cluster_policy_update" => {
            service
                .cluster_policy_update(rctx, parse::<ClusterPolicyRequest>(method, params)?)
                .await
        }

        // nodes
        "node_list" => Ok(json!(
            service.node_list(rctx, parse::<NodeListRequest>(method, params)?).await?
        )),
        "node_create" => {
            service
                .node_create(rctx, parse::<NodeCreateRequest>(method, params)?)
                .await
        }
        "node_get" => {
            let req: NodeGetRequest = parse(method, params)?;
            service.node_get(rctx, &req.identity, req.show_details).await
        }
        "node_update" => {
            service
                .node_update(rctx, parse::<NodeUpdateRequest>(method, params)?)
                .await
        }
        "node_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.node_delete(rctx, &req.identity).await
        }
        "node_join" => {
            let req: NodeJoinRequest = parse(method, params)?;
            service.node_join(rctx, &req.identity, &req.cluster_id).await
        }
        "node_leave" => {
            let req: IdentityRequest = parse(method, params)?;
            service.node_leave(rctx, &req.identity).await
        }

        // webhooks
        "webhook_list" => Ok(json!(
            service.webhook_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "webhook_create" => {
            service
                .webhook_create(rctx, parse::<WebhookCreateRequest>(method, params)?)
                .await
        }
        "webhook_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.webhook_get(rctx, &req.identity).await
        }
        "webhook_trigger" => {
            service
                .webhook_trigger(rctx, parse::<WebhookTriggerRequest>(method, params)?)
                .await
        }
        "webhook_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.webhook_delete(rctx, &req.identity).await
        }

        // triggers
        "trigger_type_list" => service.trigger_type_list(rctx).await,
        "trigger_list" => Ok(json!(
            service.trigger_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "trigger_create" => {
            service
                .trigger_create(rctx, parse::<TriggerCreateRequest>(method, params)?)
                .await
        }
        "trigger_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.trigger_get(rctx, &req.identity).await
        }
        "trigger_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.trigger_delete(rctx, &req.identity).await
        }

        // actions & events
        "action_list" => Ok(json!(
            service.action_list(rctx, parse::<ListRequest>(method, params)?).await?
        )),
        "action_create" => {
            service
                .action_create(rctx, parse::<ActionCreateRequest>(method, params)?)
                .await
        }
        "action_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.action_get(rctx, &req.identity).await
        }
        "action_delete" => {
            let req: IdentityRequest = parse(method, params)?;
            service.action_delete(rctx, &req.identity).await
        }
        "event_list" => Ok(json!(
            service.event_list(rctx, parse::<EventListRequest>(method, params)?).await?
        )),
        "event_get" => {
            let req: IdentityRequest = parse(method, params)?;
            service.event_get(rctx, &req.identity).await
        }

        other => Err(Error::BadRequest(format!("unknown method '{other}'"))),
    }
}
