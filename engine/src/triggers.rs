//! Trigger plugin contract. Triggers describe alarm conditions whose firing
//! (through a webhook) synthesizes actions; the engine validates and stores
//! them but does not evaluate them itself.

use serde::Deserialize;
use serde_json::{Value, json};

use drover_common::{Error, Result};

pub trait TriggerPlugin: Send + Sync {
    fn type_key(&self) -> &'static str;
    fn validate(&self) -> Result<()>;
}

pub mod threshold {
    use super::*;

    pub const TYPE_KEY: &str = "alarm.threshold-1.0";

    const OPERATORS: &[&str] = &["lt", "le", "eq", "ne", "ge", "gt"];

    fn default_period() -> u32 {
        60
    }

    fn default_evaluations() -> u32 {
        1
    }

    #[derive(Debug, Deserialize)]
    struct Properties {
        metric: String,
        op: String,
        threshold: f64,
        #[serde(default = "default_period")]
        period: u32,
        #[serde(default = "default_evaluations")]
        evaluations: u32,
    }

    pub struct ThresholdAlarm {
        properties: Properties,
    }

    pub fn factory(spec: &Value) -> Result<Box<dyn TriggerPlugin>> {
        let properties = spec.get("properties").cloned().unwrap_or(json!({}));
        let properties: Properties = serde_json::from_value(properties)
            .map_err(|e| Error::InvalidSpec(format!("bad threshold alarm spec: {e}")))?;
        Ok(Box::new(ThresholdAlarm { properties }))
    }

    pub fn schema() -> Value {
        json!({
            "metric": {"type": "string", "required": true},
            "op": {"type": "string", "enum": OPERATORS, "required": true},
            "threshold": {"type": "number", "required": true},
            "period": {"type": "integer", "default": 60},
            "evaluations": {"type": "integer", "default": 1},
        })
    }

    impl TriggerPlugin for ThresholdAlarm {
        fn type_key(&self) -> &'static str {
            TYPE_KEY
        }

        fn validate(&self) -> Result<()> {
            if self.properties.metric.trim().is_empty() {
                return Err(Error::InvalidSpec("alarm metric must not be empty".into()));
            }
            if !OPERATORS.contains(&self.properties.op.as_str()) {
                return Err(Error::InvalidSpec(format!(
                    "alarm op '{}' is not one of {OPERATORS:?}",
                    self.properties.op
                )));
            }
            if self.properties.period == 0 || self.properties.evaluations == 0 {
                return Err(Error::InvalidSpec(
                    "alarm period and evaluations must be positive".into(),
                ));
            }
            if !self.properties.threshold.is_finite() {
                return Err(Error::InvalidSpec("alarm threshold must be finite".into()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn threshold_alarm_validates_operator() {
        let ok = threshold::factory(&json!({
            "properties": {"metric": "cpu_util", "op": "gt", "threshold": 80.0}
        }))
        .unwrap();
        assert!(ok.validate().is_ok());

        let bad = threshold::factory(&json!({
            "properties": {"metric": "cpu_util", "op": "above", "threshold": 80.0}
        }))
        .unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn missing_metric_is_rejected_at_parse() {
        assert!(threshold::factory(&json!({"properties": {"op": "gt"}})).is_err());
    }
}
