//! Typed view over the merged configuration document.
//!
//! Every field carries a serde default so a deployment layer only states
//! what it changes: partial sections deep-merge at the document level and
//! still deserialize. Field names mirror the YAML keys.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use swb_schemas::PolicyTier;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub triage: TriageSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub ratelimit: RateLimitSettings,
    #[serde(default)]
    pub classifier: ClassifierSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub dedupe: DedupeSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub registry: RegistrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Inbox partitions older than this many months are dropped. Minimum 3.
    #[serde(default = "d_retention_months")]
    pub months: u32,
}

fn d_retention_months() -> u32 {
    3
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { months: d_retention_months() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageSettings {
    /// Rule cache refresh poll interval.
    #[serde(default = "d_triage_refresh")]
    pub refresh_seconds: u64,
    /// Thread-affinity pins expire after this long without traffic.
    #[serde(default = "d_affinity_ttl")]
    pub affinity_ttl_seconds: i64,
}

fn d_triage_refresh() -> u64 {
    30
}

fn d_affinity_ttl() -> i64 {
    86_400
}

impl Default for TriageSettings {
    fn default() -> Self {
        Self {
            refresh_seconds: d_triage_refresh(),
            affinity_ttl_seconds: d_affinity_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Above this depth, ingress is accepted but scheduled deferred.
    #[serde(default = "d_max_depth")]
    pub max_depth: usize,
    /// Above this depth, bulk-tier ingress is rejected with overload.
    #[serde(default = "d_hard_limit")]
    pub hard_limit: usize,
    /// After this many consecutive higher-tier dequeues, yield one slot to
    /// the highest non-empty lower tier.
    #[serde(default = "d_starvation_guard")]
    pub starvation_guard: u32,
}

fn d_max_depth() -> usize {
    10_000
}

fn d_hard_limit() -> usize {
    50_000
}

fn d_starvation_guard() -> u32 {
    100
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_depth: d_max_depth(),
            hard_limit: d_hard_limit(),
            starvation_guard: d_starvation_guard(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSettings {
    /// N: consecutive failures within the window that open the circuit.
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    /// W: failure-counting window.
    #[serde(default = "d_window_seconds")]
    pub window_seconds: u64,
    /// D: open-state cooldown before half-open probing.
    #[serde(default = "d_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// P: probes allowed in half-open; that many consecutive successes close.
    #[serde(default = "d_half_open_probes")]
    pub half_open_probes: u32,
}

fn d_failure_threshold() -> u32 {
    5
}

fn d_window_seconds() -> u64 {
    60
}

fn d_cooldown_seconds() -> u64 {
    30
}

fn d_half_open_probes() -> u32 {
    2
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: d_failure_threshold(),
            window_seconds: d_window_seconds(),
            cooldown_seconds: d_cooldown_seconds(),
            half_open_probes: d_half_open_probes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "d_timeout_default")]
    pub default_seconds: u64,
    #[serde(default = "d_timeout_telegram")]
    pub telegram_seconds: u64,
    #[serde(default = "d_timeout_email")]
    pub email_seconds: u64,
    #[serde(default = "d_timeout_sms")]
    pub sms_seconds: u64,
    #[serde(default = "d_timeout_chat")]
    pub chat_seconds: u64,
}

fn d_timeout_default() -> u64 {
    30
}

fn d_timeout_telegram() -> u64 {
    15
}

fn d_timeout_email() -> u64 {
    45
}

fn d_timeout_sms() -> u64 {
    20
}

fn d_timeout_chat() -> u64 {
    25
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_seconds: d_timeout_default(),
            telegram_seconds: d_timeout_telegram(),
            email_seconds: d_timeout_email(),
            sms_seconds: d_timeout_sms(),
            chat_seconds: d_timeout_chat(),
        }
    }
}

impl TimeoutSettings {
    /// Per-channel dispatch timeout; unknown channels get the default.
    pub fn for_channel(&self, channel: &str) -> Duration {
        let secs = match channel {
            "telegram" => self.telegram_seconds,
            "email" => self.email_seconds,
            "sms" => self.sms_seconds,
            "chat" => self.chat_seconds,
            _ => self.default_seconds,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierRate {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "d_rate_realtime")]
    pub realtime: TierRate,
    #[serde(default = "d_rate_default")]
    pub default: TierRate,
    #[serde(default = "d_rate_bulk")]
    pub bulk: TierRate,
}

fn d_rate_realtime() -> TierRate {
    TierRate { capacity: 100.0, refill_per_sec: 50.0 }
}

fn d_rate_default() -> TierRate {
    TierRate { capacity: 50.0, refill_per_sec: 20.0 }
}

fn d_rate_bulk() -> TierRate {
    TierRate { capacity: 10.0, refill_per_sec: 2.0 }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            realtime: d_rate_realtime(),
            default: d_rate_default(),
            bulk: d_rate_bulk(),
        }
    }
}

impl RateLimitSettings {
    pub fn for_tier(&self, tier: PolicyTier) -> TierRate {
        match tier {
            PolicyTier::Realtime => self.realtime,
            PolicyTier::Default => self.default,
            PolicyTier::Bulk => self.bulk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Classifier sink endpoint. Empty means "no classifier": every
    /// escalation falls back to `default_target`.
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default = "d_classifier_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "d_default_target")]
    pub default_target: String,
}

fn d_classifier_timeout_ms() -> u64 {
    8_000
}

fn d_default_target() -> String {
    "general".to_string()
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            timeout_ms: d_classifier_timeout_ms(),
            default_target: d_default_target(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Request-scoped overall deadline when the envelope does not carry one.
    #[serde(default = "d_deadline_default_ms")]
    pub deadline_default_ms: u64,
    #[serde(default = "d_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "d_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "d_retry_cap_ms")]
    pub retry_cap_ms: u64,
}

fn d_deadline_default_ms() -> u64 {
    60_000
}

fn d_retry_max_attempts() -> u32 {
    3
}

fn d_retry_base_ms() -> u64 {
    200
}

fn d_retry_cap_ms() -> u64 {
    5_000
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            deadline_default_ms: d_deadline_default_ms(),
            retry_max_attempts: d_retry_max_attempts(),
            retry_base_ms: d_retry_base_ms(),
            retry_cap_ms: d_retry_cap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeSettings {
    /// Cross-partition duplicate guard: pre-insert lookup scans rows received
    /// within this many days. The partial unique index covers the rest.
    #[serde(default = "d_dedupe_window_days")]
    pub window_days: u32,
}

fn d_dedupe_window_days() -> u32 {
    35
}

impl Default for DedupeSettings {
    fn default() -> Self {
        Self { window_days: d_dedupe_window_days() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "d_namespace")]
    pub namespace: String,
}

fn d_namespace() -> String {
    "switchboard".to_string()
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { namespace: d_namespace() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Directory scanned for `<name>/butler.yaml` descriptors at startup.
    #[serde(default = "d_roster_dir")]
    pub roster_dir: String,
    #[serde(default = "d_registry_refresh")]
    pub refresh_seconds: u64,
    /// Extra static endpoint overrides: butler name -> endpoint URL.
    #[serde(default)]
    pub endpoint_overrides: HashMap<String, String>,
}

fn d_roster_dir() -> String {
    "roster".to_string()
}

fn d_registry_refresh() -> u64 {
    60
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            roster_dir: d_roster_dir(),
            refresh_seconds: d_registry_refresh(),
            endpoint_overrides: HashMap::new(),
        }
    }
}
