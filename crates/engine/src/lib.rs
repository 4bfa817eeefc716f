//! capibara_engine
//!
//! The sequencer: fingerprint -> cache lookup -> (hit: optionally
//! re-execute) or (miss: prompt-process -> generate -> scan -> persist ->
//! optionally execute), wiring together every other crate in the
//! workspace and emitting one audit event at each lifecycle boundary.

use capibara_audit_spec::{
    AuditEvent, CacheCleared, CacheHit, Cancelled, EventId, ScriptExecuted, ScriptGenerated,
    ScriptId, SecurityViolationLogged, Severity as AuditSeverity, ViolationSummary,
};
use capibara_cache::{Artifact, CacheStats, ClearCriteria, Order, SortBy, Store};
use capibara_policy::PolicyStore;
use capibara_providers::{CompletionRequest, Provider, ProviderPool, ProviderStats};
use capibara_sandbox::{ExecutionRequest as SandboxExecutionRequest, SandboxRunner};
use capibara_scanner::Violation;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use uuid::Uuid;

const SUPPORTED_LANGUAGES: &[&str] = &["python", "javascript", "bash", "powershell"];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("security scan rejected the generated script")]
    SecurityViolation(Vec<Violation>),
    #[error("no providers available")]
    NoProvidersAvailable,
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("cache error: {0}")]
    Cache(#[from] capibara_cache::CacheError),
    #[error("audit log error: {0}")]
    Audit(#[from] capibara_audit_log::AuditLogError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// External string code per the engine's response contract.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidRequest(_) => "invalid_request",
            EngineError::SecurityViolation(_) => "security_violation",
            EngineError::NoProvidersAvailable => "no_providers_available",
            EngineError::GenerationFailed(_) => "generation_failed",
            EngineError::ExecutionFailed(_) => "execution_failed",
            EngineError::NotFound(_) => "not_found",
            EngineError::Cancelled => "internal_error",
            EngineError::Cache(_) => "cache_error",
            EngineError::Audit(_) | EngineError::Internal(_) => "internal_error",
        }
    }
}

impl From<capibara_providers::ProviderError> for EngineError {
    fn from(e: capibara_providers::ProviderError) -> Self {
        match e {
            capibara_providers::ProviderError::NoProvidersAvailable => {
                EngineError::NoProvidersAvailable
            }
            other => EngineError::GenerationFailed(other.to_string()),
        }
    }
}

impl From<capibara_sandbox::SandboxError> for EngineError {
    fn from(e: capibara_sandbox::SandboxError) -> Self {
        match e {
            capibara_sandbox::SandboxError::Cancelled => EngineError::Cancelled,
            other => EngineError::ExecutionFailed(other.to_string()),
        }
    }
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub language: String,
    pub context: Option<Value>,
    pub policy_name: Option<String>,
    pub provider_name: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
    pub execute: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub wall_ms: u64,
    pub cpu_ms: u64,
    pub memory_peak_mb: u64,
    pub resource_limits_exceeded: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub script_id: String,
    pub code: String,
    pub language: String,
    pub cached: bool,
    pub provider: String,
    pub fingerprint: String,
    pub created_at: f64,
    pub policy_name: String,
    pub execution_result: Option<ExecutionReport>,
}

#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub limit: usize,
    pub offset: usize,
    pub language: Option<String>,
    pub search: Option<String>,
    pub sort_by: String,
    pub order: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResponse {
    pub scripts: Vec<Artifact>,
    pub total_returned: usize,
}

#[derive(Debug, Clone)]
pub struct ShowRequest {
    pub script_id: String,
    pub include_code: bool,
    pub include_logs: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShowResponse {
    pub script_id: String,
    pub language: String,
    pub policy_name: String,
    pub provider: String,
    pub created_at: f64,
    pub access_count: u64,
    pub cache_hit_count: u64,
    pub code: Option<String>,
    /// Execution reports are ephemeral (§3 Lifecycle) - never persisted,
    /// so this is always `None` regardless of `include_logs`.
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClearRequest {
    pub script_ids: Option<Vec<String>>,
    pub language: Option<String>,
    pub older_than_seconds: Option<u64>,
    pub all: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResponse {
    pub cleared_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub overall: bool,
    pub cache: bool,
    pub providers: Vec<(String, bool)>,
    pub sandbox: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratorStats {
    pub total_generations: u64,
    pub successful_generations: u64,
    pub success_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub cache: CacheStats,
    pub providers: Vec<(String, ProviderStats)>,
    pub generator: GeneratorStats,
}

fn language_instructions(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "python" => "Python-specific requirements:\n- Use type hints where appropriate\n- Follow PEP 8 style\n- Handle exceptions explicitly rather than letting them propagate silently\n- Prefer pathlib over manual path joining",
        "javascript" => "JavaScript-specific requirements:\n- Use modern ES6+ syntax\n- Wrap fallible calls in try/catch\n- Use const/let, never var\n- Validate inputs before use",
        "bash" => "Bash-specific requirements:\n- Use set -euo pipefail\n- Quote all variable expansions\n- Check required commands exist before relying on them",
        "powershell" => "PowerShell-specific requirements:\n- Use try/catch for error handling\n- Use Write-Output for data, not Write-Host\n- Validate parameters explicitly",
        _ => "",
    }
}

fn build_generation_prompt(language: &str, processed_prompt: &str) -> String {
    format!(
        "Generate a {language} script that accomplishes the following task:\n\n\
         {processed_prompt}\n\n\
         {instructions}\n\n\
         Requirements:\n\
         - Write clean, production-ready code\n\
         - Include proper error handling\n\
         - Create a function that accepts parameters, not hardcoded values\n\
         - Include a demonstration entry point that calls the function with example arguments\n\n\
         Return only the executable code, no explanations or markdown formatting.",
        language = language,
        processed_prompt = processed_prompt,
        instructions = language_instructions(language),
    )
}

fn strip_markdown_fences(code: &str) -> String {
    let trimmed = code.trim();
    let without_leading = match trimmed.strip_prefix("```") {
        Some(rest) => match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        },
        None => trimmed,
    };
    without_leading.strip_suffix("```").unwrap_or(without_leading).trim().to_string()
}

fn validate_python_syntax(code: &str) -> Result<(), EngineError> {
    rustpython_parser::parse(code, rustpython_parser::Mode::Module, "<generated>")
        .map(|_| ())
        .map_err(|e| EngineError::GenerationFailed(format!("invalid Python syntax: {e}")))
}

fn validate_javascript_syntax(code: &str) -> Result<(), EngineError> {
    if code.matches('{').count() != code.matches('}').count() {
        return Err(EngineError::GenerationFailed("unmatched braces in generated JavaScript".into()));
    }
    if code.matches('(').count() != code.matches(')').count() {
        return Err(EngineError::GenerationFailed("unmatched parentheses in generated JavaScript".into()));
    }
    Ok(())
}

fn postprocess_generated_code(raw: &str, language: &str) -> Result<String, EngineError> {
    let cleaned = strip_markdown_fences(raw);
    if cleaned.is_empty() {
        return Err(EngineError::GenerationFailed("generated code is empty".into()));
    }
    match language.to_lowercase().as_str() {
        "python" => validate_python_syntax(&cleaned)?,
        "javascript" => validate_javascript_syntax(&cleaned)?,
        _ => {}
    }
    Ok(cleaned)
}

/// Wires fingerprinting, the cache, the provider pool, the policy store,
/// the scanner, the sandbox runner, and the audit sink into the single
/// request sequencer described by spec §4.9. One `Engine` is built per
/// process via constructor-style wiring - no ambient config singleton.
pub struct Engine {
    cache: Store,
    policies: PolicyStore,
    providers: ProviderPool,
    sandbox: Option<SandboxRunner>,
    audit: AsyncMutex<capibara_audit_log::AuditAppender>,
    violations_audit: AsyncMutex<capibara_audit_log::AuditAppender>,
    populate_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    total_generations: AtomicU64,
    successful_generations: AtomicU64,
}

impl Engine {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        audit_log_path: impl Into<PathBuf>,
        violations_log_path: impl Into<PathBuf>,
        policies_dir: impl Into<PathBuf>,
        providers: Vec<Box<dyn Provider>>,
        sandbox: Option<SandboxRunner>,
    ) -> Result<Self, EngineError> {
        let cache = Store::new(cache_dir)?;
        let policies = PolicyStore::load(policies_dir.into())
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let audit = capibara_audit_log::AuditAppender::open(audit_log_path.into())?;
        let violations_audit = capibara_audit_log::AuditAppender::open(violations_log_path.into())?;

        Ok(Self {
            cache,
            policies,
            providers: ProviderPool::new(providers),
            sandbox,
            audit: AsyncMutex::new(audit),
            violations_audit: AsyncMutex::new(violations_audit),
            populate_locks: StdMutex::new(HashMap::new()),
            total_generations: AtomicU64::new(0),
            successful_generations: AtomicU64::new(0),
        })
    }

    fn validate_run_request(&self, request: &RunRequest) -> Result<(), EngineError> {
        if request.prompt.trim().is_empty() {
            return Err(EngineError::InvalidRequest("prompt must not be empty".into()));
        }
        if !SUPPORTED_LANGUAGES.contains(&request.language.to_lowercase().as_str()) {
            return Err(EngineError::InvalidRequest(format!(
                "unsupported language: {}",
                request.language
            )));
        }
        Ok(())
    }

    fn populate_lock(&self, fingerprint: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.populate_locks.lock().unwrap();
        locks
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn append_audit(&self, event: AuditEvent) -> Result<(), EngineError> {
        let mut appender = self.audit.lock().await;
        appender.append(event)?;
        Ok(())
    }

    async fn append_violation(&self, fingerprint: &str, violation: &Violation, now: f64) -> Result<(), EngineError> {
        let severity = match violation.severity {
            capibara_scanner::Severity::Error => AuditSeverity::Error,
            capibara_scanner::Severity::Warning => AuditSeverity::Warning,
            capibara_scanner::Severity::Info => AuditSeverity::Info,
        };
        let event = AuditEvent::SecurityViolationLogged(SecurityViolationLogged {
            event_id: EventId(Uuid::new_v4()),
            ts: now,
            fingerprint: fingerprint.to_string(),
            violation: ViolationSummary {
                rule_id: violation.rule_name.clone(),
                severity,
                message: violation.message.clone(),
                line_number: violation.line,
            },
        });
        {
            let mut appender = self.audit.lock().await;
            appender.append(event.clone())?;
        }
        let mut violations_appender = self.violations_audit.lock().await;
        violations_appender.append(event)?;
        Ok(())
    }

    /// Run a generation (and optional execution) request to completion.
    pub async fn run(&self, request: RunRequest) -> Result<RunResponse, EngineError> {
        self.run_cancellable(request, None).await
    }

    /// Same as `run`, racing the remaining pipeline against `cancel`. On
    /// cancellation, any in-flight sandbox container is killed and no
    /// artifact is cached, per §5's cancellation contract.
    pub async fn run_cancellable(
        &self,
        request: RunRequest,
        cancel: Option<Arc<Notify>>,
    ) -> Result<RunResponse, EngineError> {
        self.validate_run_request(&request)?;
        let policy_name = request.policy_name.clone().unwrap_or_else(|| "moderate".to_string());
        let fingerprint = capibara_fingerprint::fingerprint(
            &request.prompt,
            &request.language,
            request.context.as_ref(),
            Some(&policy_name),
        );
        let now = unix_now();

        if let Some(artifact) = self.cache.lookup(&fingerprint, now)? {
            return self.respond_from_cache(artifact, &request, now, cancel.as_deref()).await;
        }

        let lock = self.populate_lock(&fingerprint);
        let _guard = lock.lock().await;

        // Re-check under the per-fingerprint lock: another task may have
        // populated the cache while this one waited for the guard.
        if let Some(artifact) = self.cache.lookup(&fingerprint, now)? {
            return self.respond_from_cache(artifact, &request, now, cancel.as_deref()).await;
        }

        match self
            .generate_and_respond(&request, fingerprint.clone(), policy_name, now, cancel.as_deref())
            .await
        {
            Err(EngineError::Cancelled) => {
                self.append_audit(AuditEvent::Cancelled(Cancelled {
                    event_id: EventId(Uuid::new_v4()),
                    ts: now,
                    fingerprint: Some(fingerprint),
                    stage: "generating".to_string(),
                }))
                .await
                .ok();
                Err(EngineError::Cancelled)
            }
            other => other,
        }
    }

    async fn respond_from_cache(
        &self,
        artifact: Artifact,
        request: &RunRequest,
        now: f64,
        cancel: Option<&Notify>,
    ) -> Result<RunResponse, EngineError> {
        let hit_count = self.cache.record_hit(&artifact.fingerprint, now)?;
        self.append_audit(AuditEvent::CacheHit(CacheHit {
            event_id: EventId(Uuid::new_v4()),
            ts: now,
            script_id: ScriptId(artifact.script_id.clone()),
            fingerprint: artifact.fingerprint.clone(),
            cache_hit_count: hit_count,
        }))
        .await?;

        let execution_result = if request.execute {
            Some(self.execute_artifact(&artifact, now, cancel).await?)
        } else {
            None
        };

        Ok(RunResponse {
            script_id: artifact.script_id,
            code: artifact.code,
            language: artifact.language,
            cached: true,
            provider: artifact.provider_used,
            fingerprint: artifact.fingerprint,
            created_at: artifact.created_at,
            policy_name: artifact.policy_name,
            execution_result,
        })
    }

    async fn generate_and_respond(
        &self,
        request: &RunRequest,
        fingerprint: String,
        policy_name: String,
        now: f64,
        cancel: Option<&Notify>,
    ) -> Result<RunResponse, EngineError> {
        let policy = self.policies.get(Some(&policy_name));
        let processed = capibara_promptproc::process(&request.prompt, request.context.as_ref());
        let generation_prompt = build_generation_prompt(&request.language, &processed.text);

        self.total_generations.fetch_add(1, Ordering::SeqCst);
        let completion_request = CompletionRequest::new(generation_prompt);

        let completion = match cancel {
            Some(notify) => tokio::select! {
                result = self.providers.complete(&completion_request, request.provider_name.as_deref(), now) => result.map_err(EngineError::from),
                _ = notify.notified() => Err(EngineError::Cancelled),
            },
            None => self
                .providers
                .complete(&completion_request, request.provider_name.as_deref(), now)
                .await
                .map_err(EngineError::from),
        };
        let (provider_name, reply) = completion?;

        let code = postprocess_generated_code(&reply.content, &request.language)?;

        let scan_result = capibara_scanner::scan(&code, &request.language, &policy);
        if !scan_result.passed {
            for violation in &scan_result.violations {
                self.append_violation(&fingerprint, violation, now).await?;
            }
            return Err(EngineError::SecurityViolation(scan_result.violations));
        }

        self.successful_generations.fetch_add(1, Ordering::SeqCst);

        let script_id = format!("script_{}", Uuid::new_v4());
        let artifact = Artifact {
            script_id: script_id.clone(),
            fingerprint: fingerprint.clone(),
            prompt: request.prompt.clone(),
            language: request.language.clone(),
            code,
            policy_name: policy_name.clone(),
            provider_used: provider_name,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            cache_hit_count: 0,
            cache_ttl_seconds: request.cache_ttl_seconds.unwrap_or(3600),
            metadata: serde_json::json!({}),
        };
        let stored = self.cache.store(artifact, now)?;

        self.append_audit(AuditEvent::ScriptGenerated(ScriptGenerated {
            event_id: EventId(Uuid::new_v4()),
            ts: now,
            script_id: ScriptId(script_id.clone()),
            fingerprint: fingerprint.clone(),
            language: stored.language.clone(),
            policy_name: policy_name.clone(),
            provider_used: stored.provider_used.clone(),
        }))
        .await?;

        let execution_result = if request.execute {
            Some(self.execute_artifact(&stored, now, cancel).await?)
        } else {
            None
        };

        Ok(RunResponse {
            script_id,
            code: stored.code,
            language: stored.language,
            cached: false,
            provider: stored.provider_used,
            fingerprint: stored.fingerprint,
            created_at: stored.created_at,
            policy_name: stored.policy_name,
            execution_result,
        })
    }

    async fn execute_artifact(
        &self,
        artifact: &Artifact,
        now: f64,
        cancel: Option<&Notify>,
    ) -> Result<ExecutionReport, EngineError> {
        let Some(sandbox) = &self.sandbox else {
            return Err(EngineError::ExecutionFailed("sandbox runner not configured".into()));
        };
        let policy = self.policies.get(Some(&artifact.policy_name));
        let limits = &policy.resource_limits;
        let sandbox_request = SandboxExecutionRequest {
            code: artifact.code.clone(),
            language: artifact.language.clone(),
            cpu_seconds: limits.cpu_seconds,
            memory_mb: limits.memory_mb,
            wall_seconds: limits.wall_seconds,
        };
        let report = sandbox.execute_cancellable(&sandbox_request, cancel).await?;

        let mut exceeded = Vec::new();
        if report.memory_peak_mb > u64::from(limits.memory_mb) {
            exceeded.push("memory".to_string());
        }
        if report.cpu_time_ms > u64::from(limits.cpu_seconds) * 1000 {
            exceeded.push("cpu".to_string());
        }
        let success = report.exit_code == 0 && exceeded.is_empty();

        self.append_audit(AuditEvent::ScriptExecuted(ScriptExecuted {
            event_id: EventId(Uuid::new_v4()),
            ts: now,
            script_id: ScriptId(artifact.script_id.clone()),
            exit_code: report.exit_code as i32,
            timed_out: report.timed_out,
            wall_time_ms: report.execution_time_ms,
            memory_peak_mb: report.memory_peak_mb,
            resource_limits_exceeded: exceeded.clone(),
        }))
        .await?;

        Ok(ExecutionReport {
            success,
            exit_code: report.exit_code,
            stdout: report.stdout,
            stderr: report.stderr,
            wall_ms: report.execution_time_ms,
            cpu_ms: report.cpu_time_ms,
            memory_peak_mb: report.memory_peak_mb,
            resource_limits_exceeded: exceeded,
        })
    }

    pub fn list(&self, request: ListRequest) -> Result<ListResponse, EngineError> {
        let sort_by = match request.sort_by.as_str() {
            "created_at" => SortBy::CreatedAt,
            "last_accessed_at" => SortBy::LastAccessedAt,
            "access_count" => SortBy::AccessCount,
            other => return Err(EngineError::InvalidRequest(format!("unsupported sort_by: {other}"))),
        };
        let order = match request.order.as_str() {
            "asc" => Order::Asc,
            "desc" => Order::Desc,
            other => return Err(EngineError::InvalidRequest(format!("unsupported order: {other}"))),
        };
        let scripts = self.cache.list(
            request.limit,
            request.offset,
            request.language.as_deref(),
            request.search.as_deref(),
            sort_by,
            order,
        );
        let total_returned = scripts.len();
        Ok(ListResponse { scripts, total_returned })
    }

    pub fn show(&self, request: ShowRequest) -> Result<ShowResponse, EngineError> {
        let artifact = self
            .cache
            .list(usize::MAX, 0, None, None, SortBy::CreatedAt, Order::Asc)
            .into_iter()
            .find(|a| a.script_id == request.script_id)
            .ok_or_else(|| EngineError::NotFound(request.script_id.clone()))?;
        Ok(ShowResponse {
            script_id: artifact.script_id,
            language: artifact.language,
            policy_name: artifact.policy_name,
            provider: artifact.provider_used,
            created_at: artifact.created_at,
            access_count: artifact.access_count,
            cache_hit_count: artifact.cache_hit_count,
            code: if request.include_code { Some(artifact.code) } else { None },
            logs: None,
        })
    }

    pub async fn clear(&self, request: ClearRequest) -> Result<ClearResponse, EngineError> {
        let now = unix_now();
        let criteria = ClearCriteria {
            script_ids: request.script_ids.clone(),
            language: request.language.clone(),
            older_than_seconds: request.older_than_seconds,
            all: request.all,
        };
        let cleared_count = self.cache.clear(&criteria, now)?;
        self.append_audit(AuditEvent::CacheCleared(CacheCleared {
            event_id: EventId(Uuid::new_v4()),
            ts: now,
            criteria: serde_json::json!({
                "script_ids": request.script_ids,
                "language": request.language,
                "older_than_seconds": request.older_than_seconds,
                "all": request.all,
            }),
            cleared_count,
        }))
        .await?;
        Ok(ClearResponse { cleared_count })
    }

    pub async fn health(&self) -> HealthResponse {
        let providers: Vec<(String, bool)> = self
            .providers
            .stats()
            .into_iter()
            .map(|(name, stats)| (name, stats.health_status))
            .collect();
        let sandbox_ok = match &self.sandbox {
            Some(s) => s.health_probe().await,
            None => false,
        };
        let providers_ok = providers.iter().any(|(_, healthy)| *healthy);
        HealthResponse {
            overall: providers_ok && sandbox_ok,
            cache: true,
            providers,
            sandbox: sandbox_ok,
        }
    }

    pub fn stats(&self) -> StatsResponse {
        let total = self.total_generations.load(Ordering::SeqCst);
        let successful = self.successful_generations.load(Ordering::SeqCst);
        let success_rate_percent = if total > 0 {
            (successful as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        StatsResponse {
            cache: self.cache.stats(),
            providers: self.providers.stats(),
            generator: GeneratorStats {
                total_generations: total,
                successful_generations: successful,
                success_rate_percent,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct FakeProvider {
        code: String,
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "fake"
        }
        fn priority(&self) -> u32 {
            1
        }
        async fn complete(
            &self,
            _req: &CompletionRequest,
        ) -> Result<capibara_providers::ProviderReply, capibara_providers::ProviderError> {
            Ok(capibara_providers::ProviderReply {
                content: self.code.clone(),
                finish_reason: Some("stop".into()),
                usage: Default::default(),
                provider_request_id: None,
            })
        }
        async fn health_probe(&self) -> bool {
            true
        }
    }

    fn build_engine(td: &TempDir, code: &str) -> Engine {
        Engine::new(
            td.path().join("cache"),
            td.path().join("audit.jsonl"),
            td.path().join("violations.jsonl"),
            td.path().join("policies"),
            vec![Box::new(FakeProvider { code: code.to_string() })],
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn second_run_is_served_from_cache() {
        let td = TempDir::new().unwrap();
        let engine = build_engine(&td, "def add(a, b):\n    return a + b\n\nprint(add(1, 2))\n");

        let request = || RunRequest {
            prompt: "add two numbers".into(),
            language: "python".into(),
            context: None,
            policy_name: Some("moderate".into()),
            provider_name: None,
            cache_ttl_seconds: None,
            execute: false,
        };

        let first = engine.run(request()).await.unwrap();
        assert!(!first.cached);

        let second = engine.run(request()).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.script_id, second.script_id);
    }

    #[tokio::test]
    async fn dangerous_code_is_rejected_as_security_violation() {
        let td = TempDir::new().unwrap();
        let engine = build_engine(&td, "import os\nos.system('rm -rf /tmp/data')\n");

        let request = RunRequest {
            prompt: "delete everything".into(),
            language: "python".into(),
            context: None,
            policy_name: Some("strict".into()),
            provider_name: None,
            cache_ttl_seconds: None,
            execute: false,
        };

        let err = engine.run(request).await.unwrap_err();
        match err {
            EngineError::SecurityViolation(violations) => {
                assert!(violations.iter().any(|v| v.rule_name == "dangerous_import"));
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn differing_input_values_still_hit_cache() {
        let td = TempDir::new().unwrap();
        let engine = build_engine(&td, "def add(a, b):\n    return a + b\n");

        let make = |inputs: serde_json::Value| RunRequest {
            prompt: "add two numbers".into(),
            language: "python".into(),
            context: Some(serde_json::json!({"inputs": inputs})),
            policy_name: None,
            provider_name: None,
            cache_ttl_seconds: None,
            execute: false,
        };

        let first = engine.run(make(serde_json::json!([1, 2]))).await.unwrap();
        let second = engine.run(make(serde_json::json!([99, 100]))).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[tokio::test]
    async fn clear_all_empties_the_cache() {
        let td = TempDir::new().unwrap();
        let engine = build_engine(&td, "print('hi')\n");

        engine
            .run(RunRequest {
                prompt: "say hi".into(),
                language: "python".into(),
                context: None,
                policy_name: None,
                provider_name: None,
                cache_ttl_seconds: None,
                execute: false,
            })
            .await
            .unwrap();

        let cleared = engine
            .clear(ClearRequest { all: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(cleared.cleared_count, 1);

        let listed = engine
            .list(ListRequest {
                limit: 10,
                offset: 0,
                language: None,
                search: None,
                sort_by: "created_at".into(),
                order: "desc".into(),
            })
            .unwrap();
        assert!(listed.scripts.is_empty());
    }

    #[tokio::test]
    async fn unsupported_language_is_rejected_before_any_generation() {
        let td = TempDir::new().unwrap();
        let engine = build_engine(&td, "print('hi')\n");

        let err = engine
            .run(RunRequest {
                prompt: "do a thing".into(),
                language: "ruby".into(),
                context: None,
                policy_name: None,
                provider_name: None,
                cache_ttl_seconds: None,
                execute: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
    }
}
