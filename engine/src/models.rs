//! Domain entities and the closed enumerations that govern them. These are
//! in-memory projections of store rows; all I/O lives in `db`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use drover_common::{Error, Result};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::InvalidParameter {
                        name: stringify!($name).to_string(),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    ClusterStatus {
        Init => "INIT",
        Creating => "CREATING",
        Active => "ACTIVE",
        Updating => "UPDATING",
        Resizing => "RESIZING",
        Deleting => "DELETING",
        Error => "ERROR",
        Warning => "WARNING",
    }
}

string_enum! {
    NodeStatus {
        Init => "INIT",
        Creating => "CREATING",
        Active => "ACTIVE",
        Updating => "UPDATING",
        Deleting => "DELETING",
        Error => "ERROR",
        Warning => "WARNING",
    }
}

string_enum! {
    ActionStatus {
        Init => "INIT",
        Waiting => "WAITING",
        Ready => "READY",
        Running => "RUNNING",
        Suspended => "SUSPENDED",
        Succeeded => "SUCCEEDED",
        Failed => "FAILED",
        Cancelled => "CANCELLED",
    }
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Succeeded | ActionStatus::Failed | ActionStatus::Cancelled
        )
    }

    /// Legal edges of the action status graph. Everything the dispatcher or
    /// the store writes must traverse one of these.
    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Init, Waiting)
                | (Init, Ready)
                | (Init, Cancelled)
                | (Waiting, Ready)
                | (Waiting, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Running, Suspended)
                | (Running, Ready)
                | (Suspended, Ready)
                | (Suspended, Cancelled)
        )
    }
}

string_enum! {
    ActionCause {
        Rpc => "RPC",
        Derived => "DERIVED",
        Retry => "RETRY",
    }
}

string_enum! {
    ActionSignal {
        Cancel => "CANCEL",
        Suspend => "SUSPEND",
        Resume => "RESUME",
    }
}

string_enum! {
    ActionKind {
        ClusterCreate => "CLUSTER_CREATE",
        ClusterUpdate => "CLUSTER_UPDATE",
        ClusterDelete => "CLUSTER_DELETE",
        ClusterAddNodes => "CLUSTER_ADD_NODES",
        ClusterDelNodes => "CLUSTER_DEL_NODES",
        ClusterResize => "CLUSTER_RESIZE",
        ClusterScaleIn => "CLUSTER_SCALE_IN",
        ClusterScaleOut => "CLUSTER_SCALE_OUT",
        ClusterAttachPolicy => "CLUSTER_ATTACH_POLICY",
        ClusterDetachPolicy => "CLUSTER_DETACH_POLICY",
        ClusterUpdatePolicy => "CLUSTER_UPDATE_POLICY",
        NodeCreate => "NODE_CREATE",
        NodeUpdate => "NODE_UPDATE",
        NodeDelete => "NODE_DELETE",
        NodeJoin => "NODE_JOIN",
        NodeLeave => "NODE_LEAVE",
    }
}

impl ActionKind {
    pub const ALL: &'static [ActionKind] = &[
        ActionKind::ClusterCreate,
        ActionKind::ClusterUpdate,
        ActionKind::ClusterDelete,
        ActionKind::ClusterAddNodes,
        ActionKind::ClusterDelNodes,
        ActionKind::ClusterResize,
        ActionKind::ClusterScaleIn,
        ActionKind::ClusterScaleOut,
        ActionKind::ClusterAttachPolicy,
        ActionKind::ClusterDetachPolicy,
        ActionKind::ClusterUpdatePolicy,
        ActionKind::NodeCreate,
        ActionKind::NodeUpdate,
        ActionKind::NodeDelete,
        ActionKind::NodeJoin,
        ActionKind::NodeLeave,
    ];

    /// First underscore-segment, lower-cased: "cluster" or "node". Webhooks
    /// may only carry kinds whose prefix matches their object type.
    pub fn obj_prefix(&self) -> &'static str {
        match self {
            k if k.as_str().starts_with("CLUSTER_") => "cluster",
            _ => "node",
        }
    }

    pub fn is_cluster_kind(&self) -> bool {
        self.obj_prefix() == "cluster"
    }
}

string_enum! {
    AdjustmentType {
        ExactCapacity => "EXACT_CAPACITY",
        ChangeInCapacity => "CHANGE_IN_CAPACITY",
        ChangeInPercentage => "CHANGE_IN_PERCENTAGE",
    }
}

string_enum! {
    HookPhase {
        Before => "BEFORE",
        After => "AFTER",
    }
}

string_enum! {
    EventLevel {
        Debug => "DEBUG",
        Info => "INFO",
        Warning => "WARNING",
        Error => "ERROR",
    }
}

string_enum! {
    WebhookObjType {
        Cluster => "cluster",
        Node => "node",
        Policy => "policy",
    }
}

string_enum! {
    CheckStatus {
        Ok => "CHECK_OK",
        Error => "CHECK_ERROR",
    }
}

/// Max size sentinel: no upper bound on cluster capacity.
pub const UNBOUNDED: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    pub profile_id: Uuid,
    /// Enclosing cluster for nested topologies, if any.
    pub parent: Option<Uuid>,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub desired_capacity: i32,
    pub min_size: i32,
    /// -1 means unbounded.
    pub max_size: i32,
    /// Default deadline, in seconds, for actions targeting this cluster.
    pub timeout: i64,
    pub status: ClusterStatus,
    pub status_reason: String,
    pub metadata: Value,
    /// Ancillary data written by policies, e.g. `loadbalancers` keyed by
    /// policy id.
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub profile_id: Uuid,
    /// None = orphan node.
    pub cluster_id: Option<Uuid>,
    pub role: Option<String>,
    /// Dense 1-based position within the cluster; -1 for orphans. Assigned
    /// monotonically at creation and never re-packed on removal.
    pub index: i32,
    pub status: NodeStatus,
    pub status_reason: String,
    /// Driver-assigned identifier; empty until provisioned.
    pub physical_id: Option<String>,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub metadata: Value,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub name: String,
    /// Registry key, e.g. `server.basic-1.0`.
    pub type_name: String,
    pub spec: Value,
    pub permission: Option<String>,
    pub metadata: Value,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub name: String,
    /// Registry key, e.g. `loadbalance.membership-1.0`.
    pub type_name: String,
    pub spec: Value,
    /// Enforcement level, 0..=100.
    pub level: i32,
    /// Seconds between consecutive enforcements of this policy.
    pub cooldown: i64,
    pub data: Value,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Attachment of a policy to a cluster, with per-binding settings and the
/// artifacts the policy persisted at attach time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPolicy {
    pub cluster_id: Uuid,
    pub policy_id: Uuid,
    pub priority: i32,
    pub level: i32,
    pub cooldown: i64,
    pub enabled: bool,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Typed action payload, indexed by kind. The serialized form is the JSON
/// stored in the action row's `inputs` column; the external tag keeps old
/// rows readable by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionInputs {
    ClusterCreate,
    ClusterUpdate {
        new_profile_id: Uuid,
    },
    ClusterDelete,
    ClusterAddNodes {
        nodes: Vec<Uuid>,
    },
    ClusterDelNodes {
        nodes: Vec<Uuid>,
    },
    ClusterResize {
        adj_type: Option<AdjustmentType>,
        number: Option<f64>,
        min_size: Option<i32>,
        max_size: Option<i32>,
        min_step: Option<i32>,
        strict: bool,
    },
    ClusterScaleIn {
        count: Option<i32>,
    },
    ClusterScaleOut {
        count: Option<i32>,
    },
    ClusterAttachPolicy {
        policy_id: Uuid,
        priority: i32,
        level: i32,
        cooldown: i64,
        enabled: bool,
    },
    ClusterDetachPolicy {
        policy_id: Uuid,
    },
    ClusterUpdatePolicy {
        policy_id: Uuid,
        priority: Option<i32>,
        level: Option<i32>,
        cooldown: Option<i64>,
        enabled: Option<bool>,
    },
    NodeCreate,
    NodeUpdate {
        new_profile_id: Option<Uuid>,
        name: Option<String>,
        role: Option<String>,
        metadata: Option<Value>,
    },
    NodeDelete,
    NodeJoin {
        cluster_id: Uuid,
    },
    NodeLeave,
}

impl ActionInputs {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionInputs::ClusterCreate => ActionKind::ClusterCreate,
            ActionInputs::ClusterUpdate { .. } => ActionKind::ClusterUpdate,
            ActionInputs::ClusterDelete => ActionKind::ClusterDelete,
            ActionInputs::ClusterAddNodes { .. } => ActionKind::ClusterAddNodes,
            ActionInputs::ClusterDelNodes { .. } => ActionKind::ClusterDelNodes,
            ActionInputs::ClusterResize { .. } => ActionKind::ClusterResize,
            ActionInputs::ClusterScaleIn { .. } => ActionKind::ClusterScaleIn,
            ActionInputs::ClusterScaleOut { .. } => ActionKind::ClusterScaleOut,
            ActionInputs::ClusterAttachPolicy { .. } => ActionKind::ClusterAttachPolicy,
            ActionInputs::ClusterDetachPolicy { .. } => ActionKind::ClusterDetachPolicy,
            ActionInputs::ClusterUpdatePolicy { .. } => ActionKind::ClusterUpdatePolicy,
            ActionInputs::NodeCreate => ActionKind::NodeCreate,
            ActionInputs::NodeUpdate { .. } => ActionKind::NodeUpdate,
            ActionInputs::NodeDelete => ActionKind::NodeDelete,
            ActionInputs::NodeJoin { .. } => ActionKind::NodeJoin,
            ActionInputs::NodeLeave => ActionKind::NodeLeave,
        }
    }
}

/// Planner output for the grow side of a mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreationPlan {
    pub count: u32,
    #[serde(default)]
    pub nodes: Vec<Uuid>,
}

/// Planner output for the shrink side. `candidates: None` means the count is
/// known but the victim set has not been chosen yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionPlan {
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<Uuid>>,
}

/// Ephemeral scratch space shared between the planner, the policy hooks and
/// the action body. Persisted with the action row so every participant sees
/// the same plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CheckStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<CreationPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion: Option<DeletionPlan>,
}

impl ActionData {
    pub fn check_failed(&self) -> bool {
        self.status == Some(CheckStatus::Error)
    }
}

/// Durable unit of work against one target, driven through the status
/// machine by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    /// Cluster or node the action mutates.
    pub target: Uuid,
    pub kind: ActionKind,
    pub cause: ActionCause,
    /// Claiming engine; None until claimed.
    pub owner: Option<Uuid>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Seconds from claim to deadline.
    pub timeout: i64,
    pub status: ActionStatus,
    pub status_reason: String,
    pub signal: Option<ActionSignal>,
    pub inputs: ActionInputs,
    pub outputs: Value,
    pub data: ActionData,
    pub attempts: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: i64,
    pub level: EventLevel,
    pub obj_id: Uuid,
    pub obj_type: String,
    pub obj_name: String,
    pub action: Option<String>,
    pub status: String,
    pub status_reason: String,
    pub user: String,
    pub project: String,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: Uuid,
    pub name: Option<String>,
    pub obj_id: Uuid,
    pub obj_type: WebhookObjType,
    pub action: ActionKind,
    /// Hex sha-256 of the bearer key embedded in the issued URL token.
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    pub params: Value,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub name: String,
    pub type_name: String,
    pub spec: Value,
    pub description: Option<String>,
    pub enabled: bool,
    pub state: String,
    pub severity: String,
    pub user: String,
    pub project: String,
    pub domain: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

/// Row in the shared health registry. Engines publish their own liveness
/// here (check_type ENGINE_STATUS, cluster_id NULL); per-cluster health check
/// registrations use the same table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRegistry {
    pub id: Uuid,
    pub cluster_id: Option<Uuid>,
    pub check_type: String,
    pub check_interval: i64,
    pub params: Value,
    pub engine_id: Uuid,
    pub last_heartbeat: i64,
}

pub const ENGINE_STATUS_CHECK: &str = "ENGINE_STATUS";

/// Per-target mutation lock. `action_ids` has exactly one entry for
/// exclusive locks; read-only sharers may accumulate otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub target_id: Uuid,
    pub action_ids: Vec<Uuid>,
    pub exclusive: bool,
    pub engine_id: Uuid,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            ActionStatus::Init,
            ActionStatus::Waiting,
            ActionStatus::Ready,
            ActionStatus::Running,
            ActionStatus::Suspended,
            ActionStatus::Succeeded,
            ActionStatus::Failed,
            ActionStatus::Cancelled,
        ] {
            assert_eq!(ActionStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ActionStatus::parse("DONE").is_err());
    }

    #[test]
    fn action_status_graph_permits_only_legal_edges() {
        use ActionStatus::*;
        assert!(Init.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Suspended));
        assert!(Suspended.can_transition_to(Ready));
        assert!(Waiting.can_transition_to(Cancelled));

        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Cancelled.can_transition_to(Running));
        assert!(!Init.can_transition_to(Running));
    }

    #[test]
    fn kind_prefix_partitions_cluster_and_node_kinds() {
        assert_eq!(ActionKind::ClusterScaleOut.obj_prefix(), "cluster");
        assert_eq!(ActionKind::NodeJoin.obj_prefix(), "node");
        let clusters = ActionKind::ALL.iter().filter(|k| k.is_cluster_kind()).count();
        assert_eq!(clusters, 11);
        assert_eq!(ActionKind::ALL.len() - clusters, 5);
    }

    #[test]
    fn inputs_serialize_with_kind_tag() {
        let inputs = ActionInputs::ClusterScaleOut { count: Some(2) };
        let v = serde_json::to_value(&inputs).unwrap();
        assert_eq!(v["action"], "CLUSTER_SCALE_OUT");
        assert_eq!(v["count"], 2);
        let back: ActionInputs = serde_json::from_value(v).unwrap();
        assert_eq!(back.kind(), ActionKind::ClusterScaleOut);
    }

    #[test]
    fn action_data_round_trips_plans() {
        let data = ActionData {
            deletion: Some(DeletionPlan {
                count: 2,
                candidates: Some(vec![Uuid::new_v4()]),
            }),
            ..Default::default()
        };
        let v = serde_json::to_value(&data).unwrap();
        let back: ActionData = serde_json::from_value(v).unwrap();
        assert_eq!(back, data);
        assert!(!back.check_failed());
    }

    #[test]
    fn check_error_is_detected() {
        let data: ActionData =
            serde_json::from_value(json!({"status": "CHECK_ERROR", "reason": "pool down"}))
                .unwrap();
        assert!(data.check_failed());
        assert_eq!(data.reason.as_deref(), Some("pool down"));
    }
}
