//! Process-wide plugin registry. Keys are `type-version` strings; values are
//! factory functions producing plugin instances from stored specs. Populated
//! once at engine initialization and immutable afterwards; handlers receive
//! it as a parameter rather than through a global.

use std::collections::HashMap;

use serde_json::Value;

use drover_common::{Error, Result};

use crate::models::Policy;
use crate::policies::{self, PolicyPlugin};
use crate::profiles::{self, ProfilePlugin};
use crate::triggers::{self, TriggerPlugin};

pub type ProfileFactory = fn(&Value) -> Result<Box<dyn ProfilePlugin>>;
pub type PolicyFactory = fn(&Policy) -> Result<Box<dyn PolicyPlugin>>;
pub type TriggerFactory = fn(&Value) -> Result<Box<dyn TriggerPlugin>>;

type SchemaFn = fn() -> Value;

#[derive(Clone, Debug)]
pub struct ProfileEntry {
    pub factory: ProfileFactory,
    pub schema: SchemaFn,
}

#[derive(Clone)]
pub struct PolicyEntry {
    pub factory: PolicyFactory,
    pub schema: SchemaFn,
}

#[derive(Clone)]
pub struct TriggerEntry {
    pub factory: TriggerFactory,
    pub schema: SchemaFn,
}

#[derive(Default)]
pub struct Environment {
    profiles: HashMap<String, ProfileEntry>,
    policies: HashMap<String, PolicyEntry>,
    triggers: HashMap<String, TriggerEntry>,
}

fn duplicate(kind: &str, key: &str) -> Error {
    Error::Internal(anyhow::anyhow!(
        "{kind} type '{key}' is already registered with a different constructor"
    ))
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    /// Registry preloaded with the builtin plugin set.
    pub fn with_builtins() -> Result<Self> {
        let mut env = Environment::new();
        env.register_profile(
            profiles::server::TYPE_KEY,
            ProfileEntry {
                factory: profiles::server::factory,
                schema: profiles::server::schema,
            },
        )?;
        env.register_policy(
            policies::lb::TYPE_KEY,
            PolicyEntry {
                factory: policies::lb::factory,
                schema: policies::lb::schema,
            },
        )?;
        env.register_trigger(
            triggers::threshold::TYPE_KEY,
            TriggerEntry {
                factory: triggers::threshold::factory,
                schema: triggers::threshold::schema,
            },
        )?;
        Ok(env)
    }

    /// Idempotent: re-registering the same constructor under the same key is
    /// a no-op; a different constructor under an existing key is an error.
    pub fn register_profile(&mut self, key: &str, entry: ProfileEntry) -> Result<()> {
        if let Some(existing) = self.profiles.get(key) {
            if std::ptr::fn_addr_eq(existing.factory, entry.factory) {
                return Ok(());
            }
            return Err(duplicate("profile", key));
        }
        self.profiles.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn register_policy(&mut self, key: &str, entry: PolicyEntry) -> Result<()> {
        if let Some(existing) = self.policies.get(key) {
            if std::ptr::fn_addr_eq(existing.factory, entry.factory) {
                return Ok(());
            }
            return Err(duplicate("policy", key));
        }
        self.policies.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn register_trigger(&mut self, key: &str, entry: TriggerEntry) -> Result<()> {
        if let Some(existing) = self.triggers.get(key) {
            if std::ptr::fn_addr_eq(existing.factory, entry.factory) {
                return Ok(());
            }
            return Err(duplicate("trigger", key));
        }
        self.triggers.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn profile_entry(&self, key: &str) -> Result<&ProfileEntry> {
        self.profiles.get(key).ok_or_else(|| Error::NotFound {
            kind: "profile_type",
            id: key.to_string(),
        })
    }

    pub fn policy_entry(&self, key: &str) -> Result<&PolicyEntry> {
        self.policies.get(key).ok_or_else(|| Error::NotFound {
            kind: "policy_type",
            id: key.to_string(),
        })
    }

    pub fn trigger_entry(&self, key: &str) -> Result<&TriggerEntry> {
        self.triggers.get(key).ok_or_else(|| Error::NotFound {
            kind: "trigger_type",
            id: key.to_string(),
        })
    }

    pub fn new_profile(&self, key: &str, spec: &Value) -> Result<Box<dyn ProfilePlugin>> {
        (self.profile_entry(key)?.factory)(spec)
    }

    pub fn new_policy(&self, policy: &Policy) -> Result<Box<dyn PolicyPlugin>> {
        (self.policy_entry(&policy.type_name)?.factory)(policy)
    }

    pub fn new_trigger(&self, key: &str, spec: &Value) -> Result<Box<dyn TriggerPlugin>> {
        (self.trigger_entry(key)?.factory)(spec)
    }

    pub fn profile_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.profiles.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn policy_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.policies.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn trigger_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.triggers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Extract `(type, version)` from a stored spec and build the registry key.
pub fn spec_type_key(spec: &Value) -> Result<String> {
    let type_name = spec
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidSpec("spec is missing a 'type' field".into()))?;
    let version = spec
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidSpec("spec is missing a 'version' field".into()))?;
    Ok(format!("{type_name}-{version}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtins_are_registered() {
        let env = Environment::with_builtins().unwrap();
        assert_eq!(env.profile_types(), vec!["server.basic-1.0"]);
        assert_eq!(env.policy_types(), vec!["loadbalance.membership-1.0"]);
        assert_eq!(env.trigger_types(), vec!["alarm.threshold-1.0"]);
    }

    #[test]
    fn reregistering_the_same_factory_is_idempotent() {
        let mut env = Environment::with_builtins().unwrap();
        let again = ProfileEntry {
            factory: crate::profiles::server::factory,
            schema: crate::profiles::server::schema,
        };
        assert!(env.register_profile(crate::profiles::server::TYPE_KEY, again).is_ok());
        assert_eq!(env.profile_types().len(), 1);
    }

    #[test]
    fn conflicting_registration_fails() {
        fn other(_: &Value) -> Result<Box<dyn ProfilePlugin>> {
            Err(Error::InvalidSpec("never".into()))
        }
        let mut env = Environment::with_builtins().unwrap();
        let conflicting = ProfileEntry {
            factory: other,
            schema: crate::profiles::server::schema,
        };
        assert!(
            env.register_profile(crate::profiles::server::TYPE_KEY, conflicting)
                .is_err()
        );
    }

    #[test]
    fn unknown_type_is_a_client_visible_not_found() {
        let env = Environment::with_builtins().unwrap();
        let err = env.profile_entry("vm.huge-9.9").unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "profile_type", .. }));
    }

    #[test]
    fn spec_key_requires_type_and_version() {
        let key = spec_type_key(&json!({"type": "server.basic", "version": "1.0"})).unwrap();
        assert_eq!(key, "server.basic-1.0");
        assert!(spec_type_key(&json!({"type": "server.basic"})).is_err());
        assert!(spec_type_key(&json!({"version": "1.0"})).is_err());
    }
}
