//! Shared fixtures for core integration tests.

#![allow(dead_code)]

pub mod automation;

use std::time::Duration;

use crispcheck_core::CheckConfiguration;

/// Small bounds so whole batches finish in well under a second.
pub fn fast_config(concurrency_limit: usize) -> CheckConfiguration {
    CheckConfiguration {
        page_load_timeout_ms: 300,
        active_probe_timeout_ms: 120,
        interaction_timeout_ms: 80,
        post_interaction_wait_ms: 10,
        idle_wait_timeout_ms: 80,
        concurrency_limit,
    }
}

pub const PROVIDER_SCRIPT_URL: &str = "https://client.crisp.chat/l.js";

pub const SLOW: Duration = Duration::from_secs(3);
