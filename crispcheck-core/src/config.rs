use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProbeError, Result};

pub const DEFAULT_PAGE_LOAD_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ACTIVE_PROBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_INTERACTION_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POST_INTERACTION_WAIT_MS: u64 = 3_000;
pub const DEFAULT_IDLE_WAIT_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;
/// Largest pool a semaphore can hold.
pub const MAX_CONCURRENCY_LIMIT: usize = tokio::sync::Semaphore::MAX_PERMITS;

/// Per-batch timing and pool sizing.
///
/// Every field must be positive. Zero is rejected by [`validate`] rather than
/// clamped, so a bad value fails the batch before any target starts.
///
/// [`validate`]: CheckConfiguration::validate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfiguration {
    /// Bound on navigation up to DOM construction (ms).
    pub page_load_timeout_ms: u64,
    /// Bound on polling for the widget's script globals (ms).
    pub active_probe_timeout_ms: u64,
    /// Bound on triggering a chat affordance (ms).
    pub interaction_timeout_ms: u64,
    /// Grace period after a successful interaction (ms).
    pub post_interaction_wait_ms: u64,
    /// Bound on waiting for network quiescence (ms).
    pub idle_wait_timeout_ms: u64,
    /// Number of checks allowed to run at once.
    pub concurrency_limit: usize,
}

impl Default for CheckConfiguration {
    fn default() -> Self {
        Self {
            page_load_timeout_ms: DEFAULT_PAGE_LOAD_TIMEOUT_MS,
            active_probe_timeout_ms: DEFAULT_ACTIVE_PROBE_TIMEOUT_MS,
            interaction_timeout_ms: DEFAULT_INTERACTION_TIMEOUT_MS,
            post_interaction_wait_ms: DEFAULT_POST_INTERACTION_WAIT_MS,
            idle_wait_timeout_ms: DEFAULT_IDLE_WAIT_TIMEOUT_MS,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
        }
    }
}

impl CheckConfiguration {
    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_millis(self.page_load_timeout_ms)
    }

    pub fn active_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.active_probe_timeout_ms)
    }

    pub fn interaction_timeout(&self) -> Duration {
        Duration::from_millis(self.interaction_timeout_ms)
    }

    pub fn post_interaction_wait(&self) -> Duration {
        Duration::from_millis(self.post_interaction_wait_ms)
    }

    pub fn idle_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("page_load_timeout_ms", self.page_load_timeout_ms),
            ("active_probe_timeout_ms", self.active_probe_timeout_ms),
            ("interaction_timeout_ms", self.interaction_timeout_ms),
            ("post_interaction_wait_ms", self.post_interaction_wait_ms),
            ("idle_wait_timeout_ms", self.idle_wait_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value == 0 {
                return Err(ProbeError::configuration(field, "must be a positive duration"));
            }
        }
        if self.concurrency_limit == 0 {
            return Err(ProbeError::configuration(
                "concurrency_limit",
                "must be at least 1",
            ));
        }
        if self.concurrency_limit > MAX_CONCURRENCY_LIMIT {
            return Err(ProbeError::configuration(
                "concurrency_limit",
                format!("must be at most {MAX_CONCURRENCY_LIMIT}"),
            ));
        }
        Ok(())
    }
}

/// The `options` object of a streaming URL submission.
///
/// Values are signed so that negative input reaches validation instead of
/// failing deserialization with an unhelpful message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_load_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub js_check_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_idle_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interaction_timeout: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_interaction_wait: Option<i64>,
}

impl CheckOptions {
    /// Overlay these options on `base` and validate the result.
    pub fn resolve(&self, base: CheckConfiguration) -> Result<CheckConfiguration> {
        let mut config = base;
        if let Some(value) = self.page_load_timeout {
            config.page_load_timeout_ms = positive("pageLoadTimeout", value)?;
        }
        if let Some(value) = self.js_check_timeout {
            config.active_probe_timeout_ms = positive("jsCheckTimeout", value)?;
        }
        if let Some(value) = self.network_idle_timeout {
            config.idle_wait_timeout_ms = positive("networkIdleTimeout", value)?;
        }
        if let Some(value) = self.interaction_timeout {
            config.interaction_timeout_ms = positive("interactionTimeout", value)?;
        }
        if let Some(value) = self.post_interaction_wait {
            config.post_interaction_wait_ms = positive("postInteractionWait", value)?;
        }
        if let Some(value) = self.concurrency {
            config.concurrency_limit = positive("concurrency", value)? as usize;
        }
        config.validate()?;
        Ok(config)
    }
}

fn positive(field: &'static str, value: i64) -> Result<u64> {
    if value <= 0 {
        return Err(ProbeError::configuration(
            field,
            format!("must be positive, got {value}"),
        ));
    }
    Ok(value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CheckConfiguration::default();
        assert_eq!(config.page_load_timeout(), Duration::from_secs(30));
        assert_eq!(config.active_probe_timeout(), Duration::from_secs(10));
        assert_eq!(config.interaction_timeout(), Duration::from_secs(5));
        assert_eq!(config.post_interaction_wait(), Duration::from_secs(3));
        assert_eq!(config.idle_wait_timeout(), Duration::from_secs(15));
        assert_eq!(config.concurrency_limit, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_values_are_rejected_not_clamped() {
        let config = CheckConfiguration {
            concurrency_limit: 0,
            ..CheckConfiguration::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Configuration {
                field: "concurrency_limit",
                ..
            }
        ));

        let config = CheckConfiguration {
            idle_wait_timeout_ms: 0,
            ..CheckConfiguration::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_config_deserializes_over_defaults() {
        let config: CheckConfiguration =
            serde_json::from_str(r#"{"page_load_timeout_ms": 1200}"#).unwrap();
        assert_eq!(config.page_load_timeout_ms, 1200);
        assert_eq!(config.concurrency_limit, DEFAULT_CONCURRENCY_LIMIT);
    }

    #[test]
    fn options_overlay_and_validate() {
        let options: CheckOptions = serde_json::from_str(
            r#"{"concurrency": 2, "pageLoadTimeout": 5000, "jsCheckTimeout": 800}"#,
        )
        .unwrap();
        let config = options.resolve(CheckConfiguration::default()).unwrap();
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.page_load_timeout_ms, 5000);
        assert_eq!(config.active_probe_timeout_ms, 800);
        assert_eq!(config.idle_wait_timeout_ms, DEFAULT_IDLE_WAIT_TIMEOUT_MS);
    }

    #[test]
    fn negative_options_are_configuration_errors() {
        let options = CheckOptions {
            concurrency: Some(-1),
            ..CheckOptions::default()
        };
        let err = options.resolve(CheckConfiguration::default()).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Configuration {
                field: "concurrency",
                ..
            }
        ));
    }

    #[test]
    fn oversized_pools_are_rejected() {
        let config = CheckConfiguration {
            concurrency_limit: usize::MAX,
            ..CheckConfiguration::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ProbeError::Configuration {
                field: "concurrency_limit",
                ..
            })
        ));

        let at_limit = CheckConfiguration {
            concurrency_limit: MAX_CONCURRENCY_LIMIT,
            ..CheckConfiguration::default()
        };
        assert!(at_limit.validate().is_ok());

        let options = CheckOptions {
            concurrency: Some(i64::MAX),
            ..CheckOptions::default()
        };
        assert!(matches!(
            options.resolve(CheckConfiguration::default()),
            Err(ProbeError::Configuration { .. })
        ));
    }
}
