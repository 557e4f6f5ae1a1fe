//! Routing contracts: policy tiers, the ephemeral `RouteDecision`, and the
//! outbound `route.v1` / `notify.v1` envelopes sent to butlers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::ErrorCategory;

pub const SCHEMA_ROUTE_V1: &str = "route.v1";
pub const SCHEMA_NOTIFY_V1: &str = "notify.v1";

// ---------------------------------------------------------------------------
// PolicyTier
// ---------------------------------------------------------------------------

/// Scheduling class controlling priority, rate limits, and timeouts.
/// Ordering: `realtime > default > bulk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    Realtime,
    Default,
    Bulk,
}

impl PolicyTier {
    pub const ALL: [PolicyTier; 3] = [PolicyTier::Realtime, PolicyTier::Default, PolicyTier::Bulk];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyTier::Realtime => "realtime",
            PolicyTier::Default => "default",
            PolicyTier::Bulk => "bulk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "realtime" => Some(PolicyTier::Realtime),
            "default" => Some(PolicyTier::Default),
            "bulk" => Some(PolicyTier::Bulk),
            _ => None,
        }
    }

    /// Higher rank is served first.
    pub fn rank(&self) -> u8 {
        match self {
            PolicyTier::Realtime => 2,
            PolicyTier::Default => 1,
            PolicyTier::Bulk => 0,
        }
    }
}

impl std::fmt::Display for PolicyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RouteDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    Sequential,
    Parallel,
}

/// When a multi-target dispatch is considered successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// All targets must succeed.
    All,
    /// The first success wins; later targets may be skipped.
    FirstSuccess,
    /// Succeed once `k` targets have succeeded; cancel the rest best-effort.
    Quorum { k: u32 },
}

/// What a target failure does to the remaining targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortPolicy {
    StopOnFirstError,
    Continue,
    /// Abort once `k` targets have failed.
    Threshold { k: u32 },
}

/// Where a decision came from. Recorded for telemetry and audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseSource {
    Triage,
    Classifier,
    Fallback,
}

impl ParseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseSource::Triage => "triage",
            ParseSource::Classifier => "classifier",
            ParseSource::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteTarget {
    pub butler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl RouteTarget {
    pub fn named(butler: impl Into<String>) -> Self {
        Self {
            butler: butler.into(),
            prompt: None,
            prompt_version: None,
            confidence: None,
        }
    }
}

/// Ephemeral dispatch plan produced by triage, the classifier, or fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub targets: Vec<RouteTarget>,
    pub fanout_mode: FanoutMode,
    pub join_policy: JoinPolicy,
    pub abort_policy: AbortPolicy,
    pub parse_source: ParseSource,
}

impl RouteDecision {
    /// Single-target sequential plan: the shape triage short-circuits and
    /// classifier fallback both produce.
    pub fn single(target: RouteTarget, parse_source: ParseSource) -> Self {
        Self {
            targets: vec![target],
            fanout_mode: FanoutMode::Sequential,
            join_policy: JoinPolicy::All,
            abort_policy: AbortPolicy::StopOnFirstError,
            parse_source,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound envelopes
// ---------------------------------------------------------------------------

/// `route.v1`: one dispatch attempt to one butler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequestV1 {
    pub schema_version: String,
    pub request_id: Uuid,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_version: Option<String>,
    /// Envelope summary + routing provenance the butler may use.
    pub context: Value,
    /// Remaining request deadline at send time.
    pub deadline_ms: i64,
    /// 1-based attempt counter across retries.
    pub attempt: u32,
}

/// `notify.v1`: outbound delivery initiated by a butler through the
/// switchboard. Logged into the inbox table with `direction='outbound'`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyRequestV1 {
    pub schema_version: String,
    pub source_butler: String,
    pub channel: String,
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// Butler response to `route.v1` / `notify.v1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub success: bool,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

/// Per-target outcome persisted into `message_inbox.dispatch_outcomes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub butler: String,
    pub success: bool,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_is_realtime_first() {
        assert!(PolicyTier::Realtime.rank() > PolicyTier::Default.rank());
        assert!(PolicyTier::Default.rank() > PolicyTier::Bulk.rank());
    }

    #[test]
    fn tier_string_forms_round_trip() {
        for t in PolicyTier::ALL {
            assert_eq!(PolicyTier::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn quorum_policy_serializes_with_k() {
        let j = serde_json::to_value(JoinPolicy::Quorum { k: 2 }).unwrap();
        assert_eq!(j, serde_json::json!({"quorum": {"k": 2}}));
        let back: JoinPolicy = serde_json::from_value(j).unwrap();
        assert_eq!(back, JoinPolicy::Quorum { k: 2 });
    }

    #[test]
    fn single_decision_is_sequential_stop_on_first_error() {
        let d = RouteDecision::single(RouteTarget::named("general"), ParseSource::Fallback);
        assert_eq!(d.targets.len(), 1);
        assert_eq!(d.fanout_mode, FanoutMode::Sequential);
        assert_eq!(d.abort_policy, AbortPolicy::StopOnFirstError);
        assert_eq!(d.parse_source, ParseSource::Fallback);
    }
}
