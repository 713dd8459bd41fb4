//! Common configuration types for Camera Hub components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default tracing filter when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "hub_service=debug,tower_http=debug";

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing filter directive (`RUST_LOG` syntax)
    pub log_filter: String,
    /// Enable JSON-formatted logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// Build from environment-style variables (`RUST_LOG`, `HUB_LOG_JSON`).
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let log_filter = vars
            .get("RUST_LOG")
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let json_logs = vars
            .get("HUB_LOG_JSON")
            .is_some_and(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));

        Self {
            log_filter,
            json_logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let cfg = ObservabilityConfig::from_vars(&HashMap::new());
        assert_eq!(cfg, ObservabilityConfig::default());
    }

    #[test]
    fn test_json_flag_parsing() {
        for (raw, expected) in [("true", true), ("1", true), ("YES", true), ("false", false), ("nope", false)] {
            let vars = HashMap::from([("HUB_LOG_JSON".to_string(), raw.to_string())]);
            assert_eq!(ObservabilityConfig::from_vars(&vars).json_logs, expected, "{raw}");
        }
    }

    #[test]
    fn test_empty_rust_log_falls_back() {
        let vars = HashMap::from([("RUST_LOG".to_string(), "  ".to_string())]);
        assert_eq!(
            ObservabilityConfig::from_vars(&vars).log_filter,
            DEFAULT_LOG_FILTER
        );
    }
}
