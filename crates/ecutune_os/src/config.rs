#![forbid(unsafe_code)]

use ecutune_engines::safety_rules::SafetyThresholds;
use ecutune_engines::validator::CalibrationValidatorConfig;

pub const ENV_MAX_CONCURRENT_SESSIONS: &str = "ECUTUNE_MAX_CONCURRENT_SESSIONS";
pub const ENV_LIVE_APPLY_TIMEOUT_MINUTES: &str = "ECUTUNE_LIVE_APPLY_TIMEOUT_MINUTES";
pub const ENV_REQUIRE_VERIFICATION: &str = "ECUTUNE_REQUIRE_VERIFICATION";
pub const ENV_MONITOR_INTERVAL_MS: &str = "ECUTUNE_MONITOR_INTERVAL_MS";
pub const ENV_PROACTIVE_EXPIRY: &str = "ECUTUNE_PROACTIVE_EXPIRY";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_concurrent_sessions: usize,
    pub live_apply_timeout_minutes: u32,
    /// Unverified live writes are reverted and the session fails.
    pub require_verification: bool,
    pub monitor_interval_ms: u64,
    pub proactive_expiry: bool,
    pub event_capacity: usize,
    pub safety: SafetyThresholds,
    pub validator: CalibrationValidatorConfig,
}

impl OrchestratorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_concurrent_sessions: 4,
            live_apply_timeout_minutes: 10,
            require_verification: true,
            monitor_interval_ms: 1_000,
            proactive_expiry: false,
            event_capacity: 256,
            safety: SafetyThresholds::mvp_v1(),
            validator: CalibrationValidatorConfig::mvp_v1(),
        }
    }

    /// Out-of-range or unparsable values fall back to the `mvp_v1` default.
    pub fn from_env_var_map<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::mvp_v1();
        Self {
            max_concurrent_sessions: lookup(ENV_MAX_CONCURRENT_SESSIONS)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| (1..=64).contains(v))
                .unwrap_or(base.max_concurrent_sessions),
            live_apply_timeout_minutes: lookup(ENV_LIVE_APPLY_TIMEOUT_MINUTES)
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| (1..=240).contains(v))
                .unwrap_or(base.live_apply_timeout_minutes),
            require_verification: lookup(ENV_REQUIRE_VERIFICATION)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(base.require_verification),
            monitor_interval_ms: lookup(ENV_MONITOR_INTERVAL_MS)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| (10..=60_000).contains(v))
                .unwrap_or(base.monitor_interval_ms),
            proactive_expiry: lookup(ENV_PROACTIVE_EXPIRY)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(base.proactive_expiry),
            ..base
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_var_map(|key| std::env::var(key).ok())
    }

    pub fn live_apply_timeout_ms(&self) -> u64 {
        u64::from(self.live_apply_timeout_minutes) * 60_000
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
