//! capibara_audit_spec
//!
//! Strongly-typed audit events emitted by the engine at each lifecycle
//! boundary: generation, cache hits, execution, security rejections,
//! cache clears, cancellation. One event variant per boundary, tagged by
//! `event_type` on the wire so a reader of audit.jsonl can dispatch on a
//! single field without inspecting the payload shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub r#type: String, // "artifact_ref"
    pub hash: String,   // sha256:...
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationSummary {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub line_number: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptGenerated {
    pub event_id: EventId,
    pub ts: f64,
    pub script_id: ScriptId,
    pub fingerprint: String,
    pub language: String,
    pub policy_name: String,
    pub provider_used: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHit {
    pub event_id: EventId,
    pub ts: f64,
    pub script_id: ScriptId,
    pub fingerprint: String,
    pub cache_hit_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptExecuted {
    pub event_id: EventId,
    pub ts: f64,
    pub script_id: ScriptId,
    pub exit_code: i32,
    pub timed_out: bool,
    pub wall_time_ms: u64,
    pub memory_peak_mb: u64,
    pub resource_limits_exceeded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityViolationLogged {
    pub event_id: EventId,
    pub ts: f64,
    pub fingerprint: String,
    pub violation: ViolationSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheCleared {
    pub event_id: EventId,
    pub ts: f64,
    pub criteria: Value,
    pub cleared_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancelled {
    pub event_id: EventId,
    pub ts: f64,
    pub fingerprint: Option<String>,
    pub stage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    ScriptGenerated(ScriptGenerated),
    CacheHit(CacheHit),
    ScriptExecuted(ScriptExecuted),
    SecurityViolationLogged(SecurityViolationLogged),
    CacheCleared(CacheCleared),
    Cancelled(Cancelled),
}
