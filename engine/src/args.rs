use std::time::Duration;

use clap::Parser;
use drover_common::args::PostgresArgs;

use crate::context::EngineDefaults;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct EngineArgs {
    #[arg(long, env = "API_PORT", default_value_t = 8778)]
    pub api_port: u16,

    /// Size of the action worker pool.
    #[arg(long, env = "ENGINE_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Liveness heartbeat period; locks of engines silent for twice this
    /// long may be stolen.
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 5000)]
    pub heartbeat_interval_ms: u64,

    /// Cap for the idle claim backoff.
    #[arg(long, env = "CLAIM_BACKOFF_CAP_MS", default_value_t = 5000)]
    pub claim_backoff_cap_ms: u64,

    /// How long a signalled action may wind down before it is failed.
    #[arg(long, env = "CANCEL_GRACE_MS", default_value_t = 10000)]
    pub cancel_grace_ms: u64,

    /// Seconds from claim to deadline when an intent carries no timeout.
    #[arg(long, env = "DEFAULT_ACTION_TIMEOUT", default_value_t = 3600)]
    pub default_action_timeout: i64,

    /// Binding priority used when a policy attach does not supply one.
    #[arg(long, env = "DEFAULT_POLICY_PRIORITY", default_value_t = 50)]
    pub default_policy_priority: i32,

    #[command(flatten)]
    pub postgres: PostgresArgs,
}

impl EngineArgs {
    pub fn defaults(&self) -> EngineDefaults {
        EngineDefaults {
            policy_priority: self.default_policy_priority,
            action_timeout: self.default_action_timeout,
            cancel_grace: Duration::from_millis(self.cancel_grace_ms),
            claim_backoff_cap: Duration::from_millis(self.claim_backoff_cap_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }
}
