//! Seams to the cloud services the engine sequences but does not implement.
//! Real deployments plug provider SDKs in here; the in-memory drivers back
//! local operation and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

fn default_protocol() -> String {
    "HTTP".into()
}

fn default_port() -> u16 {
    80
}

fn default_lb_method() -> String {
    "ROUND_ROBIN".into()
}

fn default_true() -> bool {
    true
}

fn default_connection_limit() -> i32 {
    -1
}

/// Pool half of a load-balancer request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSpec {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_port")]
    pub protocol_port: u16,
    pub subnet: String,
    #[serde(default = "default_lb_method")]
    pub lb_method: String,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub session_persistence: Option<SessionPersistence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPersistence {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub cookie_name: Option<String>,
}

/// VIP half of a load-balancer request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VipSpec {
    pub subnet: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_port")]
    pub protocol_port: u16,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorSpec {
    #[serde(rename = "type", default = "default_hm_type")]
    pub kind: String,
    #[serde(default = "default_hm_delay")]
    pub delay: u32,
    #[serde(default = "default_hm_timeout")]
    pub timeout: u32,
    #[serde(default = "default_hm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub url_path: Option<String>,
    #[serde(default)]
    pub expected_codes: Option<String>,
}

fn default_hm_type() -> String {
    "PING".into()
}

fn default_hm_delay() -> u32 {
    10
}

fn default_hm_timeout() -> u32 {
    5
}

fn default_hm_retries() -> u32 {
    3
}

/// Ids of the resources a successful lb_create produced. Persisted into the
/// policy binding so detach can tear them down again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerResources {
    pub loadbalancer: String,
    pub pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_monitor: Option<String>,
    pub vip_address: String,
}

#[async_trait]
pub trait LoadBalancerDriver: Send + Sync {
    async fn lb_create(
        &self,
        vip: &VipSpec,
        pool: &PoolSpec,
        hm: Option<&HealthMonitorSpec>,
    ) -> Result<LoadBalancerResources>;

    async fn lb_delete(&self, resources: &LoadBalancerResources) -> Result<()>;

    /// Returns the new member id.
    async fn member_add(
        &self,
        lb_id: &str,
        pool_id: &str,
        node_id: Uuid,
        port: u16,
        subnet: &str,
    ) -> Result<String>;

    async fn member_remove(&self, lb_id: &str, pool_id: &str, member_id: &str) -> Result<()>;
}

/// What a profile asks the compute service to materialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    pub flavor: String,
    pub image: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Returns the driver-assigned physical id.
    async fn server_create(&self, request: &ServerRequest) -> Result<String>;

    async fn server_delete(&self, physical_id: &str) -> Result<()>;

    async fn server_update(&self, physical_id: &str, request: &ServerRequest) -> Result<()>;
}

/// Driver handles shared by workers, policies and the façade.
#[derive(Clone)]
pub struct Drivers {
    pub compute: Arc<dyn ComputeDriver>,
    pub loadbalancer: Arc<dyn LoadBalancerDriver>,
}

impl Drivers {
    pub fn in_memory() -> Self {
        Drivers {
            compute: Arc::new(InMemoryCompute::default()),
            loadbalancer: Arc::new(InMemoryLoadBalancer::default()),
        }
    }
}

/// Compute fake: provisioning is a map insert.
#[derive(Default)]
pub struct InMemoryCompute {
    servers: Mutex<HashMap<String, ServerRequest>>,
}

#[async_trait]
impl ComputeDriver for InMemoryCompute {
    async fn server_create(&self, request: &ServerRequest) -> Result<String> {
        let physical_id = format!("srv-{}", &Uuid::new_v4().simple().to_string()[..12]);
        self.servers
            .lock()
            .unwrap()
            .insert(physical_id.clone(), request.clone());
        Ok(physical_id)
    }

    async fn server_delete(&self, physical_id: &str) -> Result<()> {
        self.servers.lock().unwrap().remove(physical_id);
        Ok(())
    }

    async fn server_update(&self, physical_id: &str, request: &ServerRequest) -> Result<()> {
        let mut servers = self.servers.lock().unwrap();
        match servers.get_mut(physical_id) {
            Some(existing) => {
                *existing = request.clone();
                Ok(())
            }
            None => Err(anyhow!("server {physical_id} does not exist")),
        }
    }
}

#[derive(Default)]
struct LbState {
    /// member id -> node id
    members: HashMap<String, Uuid>,
}

/// LBaaS fake: one entry per created load balancer, members tracked by id.
#[derive(Default)]
pub struct InMemoryLoadBalancer {
    balancers: Mutex<HashMap<String, LbState>>,
}

impl InMemoryLoadBalancer {
    /// Test helper: current pool membership for a load balancer.
    pub fn members_of(&self, lb_id: &str) -> Vec<Uuid> {
        self.balancers
            .lock()
            .unwrap()
            .get(lb_id)
            .map(|s| s.members.values().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LoadBalancerDriver for InMemoryLoadBalancer {
    async fn lb_create(
        &self,
        vip: &VipSpec,
        _pool: &PoolSpec,
        hm: Option<&HealthMonitorSpec>,
    ) -> Result<LoadBalancerResources> {
        let suffix = Uuid::new_v4().simple().to_string();
        let lb_id = format!("lb-{}", &suffix[..12]);
        self.balancers
            .lock()
            .unwrap()
            .insert(lb_id.clone(), LbState::default());
        Ok(LoadBalancerResources {
            loadbalancer: lb_id,
            pool: format!("pool-{}", &suffix[..12]),
            health_monitor: hm.map(|_| format!("hm-{}", &suffix[..12])),
            vip_address: vip
                .address
                .clone()
                .unwrap_or_else(|| "10.0.0.1".to_string()),
        })
    }

    async fn lb_delete(&self, resources: &LoadBalancerResources) -> Result<()> {
        self.balancers.lock().unwrap().remove(&resources.loadbalancer);
        Ok(())
    }

    async fn member_add(
        &self,
        lb_id: &str,
        _pool_id: &str,
        node_id: Uuid,
        _port: u16,
        _subnet: &str,
    ) -> Result<String> {
        let mut balancers = self.balancers.lock().unwrap();
        let state = balancers
            .get_mut(lb_id)
            .ok_or_else(|| anyhow!("load balancer {lb_id} does not exist"))?;
        let member_id = format!("member-{}", &Uuid::new_v4().simple().to_string()[..12]);
        state.members.insert(member_id.clone(), node_id);
        Ok(member_id)
    }

    async fn member_remove(&self, lb_id: &str, _pool_id: &str, member_id: &str) -> Result<()> {
        let mut balancers = self.balancers.lock().unwrap();
        let state = balancers
            .get_mut(lb_id)
            .ok_or_else(|| anyhow!("load balancer {lb_id} does not exist"))?;
        state
            .members
            .remove(member_id)
            .ok_or_else(|| anyhow!("member {member_id} not in pool"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn compute_fake_assigns_and_forgets_physical_ids() {
        let compute = InMemoryCompute::default();
        let req = ServerRequest {
            name: "n1".into(),
            flavor: "small".into(),
            image: "debian-12".into(),
            networks: vec![],
            metadata: Value::Null,
        };
        let id = compute.server_create(&req).await.unwrap();
        assert!(id.starts_with("srv-"));
        compute.server_delete(&id).await.unwrap();
        assert!(compute.server_update(&id, &req).await.is_err());
    }

    #[tokio::test]
    async fn lb_fake_tracks_pool_membership() {
        let lb = InMemoryLoadBalancer::default();
        let vip: VipSpec = serde_json::from_value(serde_json::json!({"subnet": "s1"})).unwrap();
        let pool: PoolSpec = serde_json::from_value(serde_json::json!({"subnet": "s1"})).unwrap();
        let res = lb.lb_create(&vip, &pool, None).await.unwrap();
        assert!(res.health_monitor.is_none());

        let node = Uuid::new_v4();
        let member = lb
            .member_add(&res.loadbalancer, &res.pool, node, 80, "s1")
            .await
            .unwrap();
        assert_eq!(lb.members_of(&res.loadbalancer), vec![node]);
        lb.member_remove(&res.loadbalancer, &res.pool, &member)
            .await
            .unwrap();
        assert!(lb.members_of(&res.loadbalancer).is_empty());
    }

    #[test]
    fn lb_specs_apply_schema_defaults() {
        let pool: PoolSpec = serde_json::from_value(serde_json::json!({"subnet": "s1"})).unwrap();
        assert_eq!(pool.protocol, "HTTP");
        assert_eq!(pool.protocol_port, 80);
        assert_eq!(pool.lb_method, "ROUND_ROBIN");
        assert!(pool.admin_state_up);

        let hm: HealthMonitorSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(hm.kind, "PING");
        assert_eq!(hm.delay, 10);
        assert_eq!(hm.max_retries, 3);
    }
}
