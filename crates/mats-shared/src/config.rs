//! # Factory Configuration
//!
//! Serde-deserializable knobs with defaults, so an embedding application can
//! load them from whatever configuration layer it uses and hand them to the
//! factory. Programmatic hooks (the initiate trace-id modifier, interceptors)
//! live on the factory itself, not here.

use serde::{Deserialize, Serialize};

/// How legal-flow violations inside a stage are treated.
///
/// `Warn` logs an error with both operations' descriptions and lets the
/// message proceed. `Fail` turns the violating operation into a hard error,
/// rolling the message back onto the DLQ path. Warn is the transitional
/// default; Fail is the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowViolation {
    #[default]
    Warn,
    Fail,
}

/// Factory-wide configuration. App identity strings end up in the debug info
/// of every produced call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Application name, for debug info and logging.
    pub app_name: String,
    pub app_version: String,
    /// Node identity; defaults to the HOSTNAME environment variable.
    pub nodename: String,
    /// Prefixed onto every endpoint id to form broker channel names.
    pub destination_prefix: String,
    /// Default per-stage processor count for queue stages.
    pub concurrency: usize,
    /// Incoming messages deeper than this are refused.
    pub max_stack_height: usize,
    /// Non-REPLY calls beyond this total are refused.
    pub max_total_call_number: u32,
    /// Redeliveries before the broker dead-letters a rolled-back message.
    pub max_redeliveries: u32,
    pub flow_violation: FlowViolation,
    /// Milliseconds a stopping stage waits for in-flight work.
    pub graceful_stop_millis: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            app_name: "MatsApp".to_string(),
            app_version: "0.0.0".to_string(),
            nodename: default_nodename(),
            destination_prefix: "mats.".to_string(),
            concurrency: default_concurrency(),
            max_stack_height: mats_trace::MAX_STACK_HEIGHT,
            max_total_call_number: mats_trace::MAX_TOTAL_CALL_NUMBER,
            max_redeliveries: 5,
            flow_violation: FlowViolation::default(),
            graceful_stop_millis: 30_000,
        }
    }
}

impl FactoryConfig {
    /// Convenience constructor covering the fields applications always set.
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            ..Self::default()
        }
    }

    /// Interactive carve-out size for a stage with `concurrency` ordinary
    /// processors: at least one, roughly half the pool.
    pub fn interactive_concurrency(concurrency: usize) -> usize {
        (concurrency / 2).max(1)
    }
}

fn default_nodename() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(4)
        .min(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FactoryConfig::default();
        assert_eq!(config.max_stack_height, 25);
        assert_eq!(config.max_total_call_number, 100);
        assert_eq!(config.flow_violation, FlowViolation::Warn);
        assert!(config.concurrency >= 1);
        assert_eq!(config.destination_prefix, "mats.");
    }

    #[test]
    fn interactive_carve_out_is_at_least_one() {
        assert_eq!(FactoryConfig::interactive_concurrency(1), 1);
        assert_eq!(FactoryConfig::interactive_concurrency(2), 1);
        assert_eq!(FactoryConfig::interactive_concurrency(6), 3);
    }

    #[test]
    fn deserializes_with_partial_fields() {
        let config: FactoryConfig =
            serde_json::from_str(r#"{"app_name":"OrderService","flow_violation":"fail"}"#).unwrap();
        assert_eq!(config.app_name, "OrderService");
        assert_eq!(config.flow_violation, FlowViolation::Fail);
        assert_eq!(config.max_stack_height, 25);
    }
}
