use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use tokio::sync::Notify;

use crate::drivers::Drivers;
use crate::registry::Environment;

/// Tunables resolved once from configuration and threaded everywhere.
#[derive(Debug, Clone)]
pub struct EngineDefaults {
    /// Binding priority used when the client does not supply one.
    pub policy_priority: i32,
    /// Seconds from claim to deadline when the intent carries no timeout.
    pub action_timeout: i64,
    /// Extra time a signalled action gets to wind down before it is failed.
    pub cancel_grace: Duration,
    /// Cap for the idle claim backoff.
    pub claim_backoff_cap: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        EngineDefaults {
            policy_priority: 50,
            action_timeout: 3600,
            cancel_grace: Duration::from_secs(10),
            claim_backoff_cap: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Everything a façade method, a worker, or a policy hook needs: the shared
/// store pool, the plugin registry, the driver seams, and the in-process
/// wake channel for freshly dispatched actions. The registry is immutable
/// after startup; the rest is connection-pooled, so cloning is cheap.
#[derive(Clone)]
pub struct EngineContext {
    pub pool: Pool,
    pub env: Arc<Environment>,
    pub drivers: Drivers,
    pub wake: Arc<Notify>,
    pub defaults: EngineDefaults,
}

impl EngineContext {
    pub fn new(pool: Pool, env: Arc<Environment>, drivers: Drivers, defaults: EngineDefaults) -> Self {
        EngineContext {
            pool,
            env,
            drivers,
            wake: Arc::new(Notify::new()),
            defaults,
        }
    }

    /// Nudge an idle worker; claimable work just landed in the store.
    pub fn notify_dispatcher(&self) {
        self.wake.notify_one();
    }
}
