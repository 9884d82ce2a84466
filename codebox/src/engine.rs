//! The execution engine
//!
//! Wires the pipeline together: validator, quota admission, worker pool,
//! isolate, artifact publisher, outcome recording and the interceptor chain.
//! Requests of one conversation are serialized on that conversation's lane;
//! different conversations only contend for pool slots.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::Instrument;
use uuid::Uuid;

use crate::artifacts::ArtifactPublisher;
use crate::cache::{DatasetReport, MemoizationCache};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::feedback::classify_trace;
use crate::interceptor::{CodeMemory, ExecutionLog, Interceptor};
use crate::isolate::{IsolateJob, IsolateRuntime, ProcessIsolate, RawArtifact, WorkerReport};
use crate::outcome::{Artifact, ArtifactKind, ErrorCategory, ExecutionOutcome, ExecutionRequest};
use crate::policy::EXECUTE_TOOL;
use crate::quota::{
    Admission, Conversation, ConversationExecutionState, ConversationStore, DatasetRecord,
    QuotaCoordinator, QuotaDenial,
};
use crate::response::{ExecuteArgs, ToolResponse};
use crate::scheduler::{PoolStats, WorkerPool};
use crate::validator::Validator;

/// Result of a call to an analysis tool routed through [`Engine::memoize`].
#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisCall {
    /// Served from the conversation's cache; nothing ran and no quota was used
    Cached(Value),
    Computed(Value),
    Denied(QuotaDenial),
}

pub struct EngineBuilder {
    config: EngineConfig,
    isolate: Option<Arc<dyn IsolateRuntime>>,
    pool: Option<Arc<WorkerPool>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            isolate: None,
            pool: None,
            interceptors: vec![Arc::new(CodeMemory), Arc::new(ExecutionLog)],
        }
    }

    pub fn isolate(mut self, isolate: Arc<dyn IsolateRuntime>) -> Self {
        self.isolate = Some(isolate);
        self
    }

    /// Share a pool constructed elsewhere (e.g. at service start).
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Append a stage after the built-in ones.
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let store = Arc::new(ConversationStore::new(config.history.max_entries));
        let isolate: Arc<dyn IsolateRuntime> = match self.isolate {
            Some(isolate) => isolate,
            None => Arc::new(
                ProcessIsolate::new(config.python_path.clone())
                    .with_max_artifact_bytes(config.artifacts.max_artifact_bytes),
            ),
        };
        let pool = self
            .pool
            .unwrap_or_else(|| Arc::new(WorkerPool::new(config.pool.size)));

        tracing::info!(
            isolate = isolate.name(),
            pool_size = pool.size(),
            wall_clock_secs = config.limits.wall_clock_secs,
            memory_mb = config.limits.memory_mb,
            "Execution engine ready"
        );

        Engine {
            validator: Validator::new(),
            coordinator: QuotaCoordinator::new(config.quota.clone()),
            cache: MemoizationCache::new(&config.cache.cacheable_tools),
            publisher: ArtifactPublisher::new(&config.artifacts),
            interceptors: self.interceptors,
            isolate,
            pool,
            store,
            config,
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    validator: Validator,
    isolate: Arc<dyn IsolateRuntime>,
    pool: Arc<WorkerPool>,
    store: Arc<ConversationStore>,
    coordinator: QuotaCoordinator,
    cache: MemoizationCache,
    publisher: ArtifactPublisher,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &QuotaCoordinator {
        &self.coordinator
    }

    pub fn cache(&self) -> &MemoizationCache {
        &self.cache
    }

    pub fn publisher(&self) -> &ArtifactPublisher {
        &self.publisher
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Inbound tool call. Engine failures become a `500 Tool error` response.
    pub async fn call_tool(&self, conversation_id: &str, args: ExecuteArgs) -> ToolResponse {
        let request = ExecutionRequest::new(conversation_id, args.code).with_capture_plot(args.save_plot);
        match self.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(conversation_id, "Tool error: {}", e);
                ToolResponse::tool_error(&e)
            }
        }
    }

    /// Run one request through the whole pipeline.
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ToolResponse> {
        let span = tracing::info_span!(
            "execute",
            execution_id = %Uuid::new_v4(),
            conversation_id = %request.conversation_id
        );
        self.execute_in_lane(request).instrument(span).await
    }

    async fn execute_in_lane(&self, request: ExecutionRequest) -> EngineResult<ToolResponse> {
        let (conversation, _lane) = self.enter_conversation(&request.conversation_id).await;

        let short_circuit = conversation.with_state(|state| {
            self.interceptors
                .iter()
                .find_map(|stage| stage.before_execute(&request, state))
        });
        if let Some(response) = short_circuit {
            tracing::info!(status = response.status, "Request answered by interceptor");
            return Ok(response);
        }

        let outcome = self.run(&conversation, &request).await?;
        let feedback = self.coordinator.record(&conversation, &outcome);
        let execution_count =
            conversation.with_state(|state| state.tool_executions(EXECUTE_TOOL));
        let mut response = ToolResponse::from_outcome(&outcome, execution_count, feedback);

        conversation.with_state(|state| {
            for stage in &self.interceptors {
                stage.after_execute(&request, &outcome, &mut response, state);
            }
        });
        Ok(response)
    }

    async fn run(
        &self,
        conversation: &Conversation,
        request: &ExecutionRequest,
    ) -> EngineResult<ExecutionOutcome> {
        if let Err(rejection) = self.validator.validate(&request.code) {
            tracing::info!(reason = ?rejection.reason, "Validation rejected: {}", rejection.message());
            return Ok(rejection.into_outcome());
        }
        tracing::debug!("Validation passed");

        if let Admission::Denied(denial) = self.coordinator.admit(conversation, EXECUTE_TOOL) {
            tracing::info!(scope = ?denial.scope, limit = denial.limit, "Admission denied");
            return Ok(denial.into_outcome());
        }

        let waited = Instant::now();
        let slot = self.pool.acquire().await?;
        tracing::debug!(pool_wait_ms = waited.elapsed().as_millis() as u64, "Pool slot acquired");
        self.coordinator.charge(conversation, EXECUTE_TOOL);

        let started = Instant::now();
        let report = self
            .isolate
            .execute(IsolateJob {
                code: &request.code,
                capture_plot: request.capture_plot,
                limits: &self.config.limits,
            })
            .await;
        drop(slot);
        let report = report?;
        tracing::info!(
            isolate = self.isolate.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            report = report_label(&report),
            "Isolate finished"
        );

        Ok(self.finish(request, report).await)
    }

    async fn finish(&self, request: &ExecutionRequest, report: WorkerReport) -> ExecutionOutcome {
        match report {
            WorkerReport::Completed {
                stdout,
                stderr,
                figures,
                html,
            } => match self.publish_all(request, &figures, html).await {
                Ok(artifacts) => ExecutionOutcome::Success {
                    stdout,
                    stderr,
                    artifacts,
                },
                Err(e) => {
                    tracing::error!("Failed to save run output: {}", e);
                    ExecutionOutcome::RuntimeFailure {
                        category: ErrorCategory::Other,
                        message: format!("Code ran but its output could not be saved: {}", e),
                        trace: String::new(),
                    }
                }
            },
            WorkerReport::Raised {
                exception,
                message,
                traceback,
            } => {
                let mut category = ErrorCategory::from_exception(&exception);
                let mut summary = if message.is_empty() {
                    exception.clone()
                } else {
                    format!("{}: {}", exception, message)
                };
                if category == ErrorCategory::Other {
                    if let Some((found, line)) = classify_trace(&traceback) {
                        category = found;
                        summary = line;
                    }
                }
                ExecutionOutcome::RuntimeFailure {
                    category,
                    message: summary,
                    trace: traceback,
                }
            }
            WorkerReport::TimedOut { after } => ExecutionOutcome::TimedOut { after },
            WorkerReport::MemoryExceeded => ExecutionOutcome::MemoryExceeded {
                limit_mb: self.config.limits.memory_mb,
            },
        }
    }

    /// Publish every artifact of a completed run, or none of them.
    async fn publish_all(
        &self,
        request: &ExecutionRequest,
        figures: &[RawArtifact],
        html: Option<String>,
    ) -> EngineResult<Vec<Artifact>> {
        let figures: &[RawArtifact] = if request.capture_plot { figures } else { &[] };
        let html = html.map(|html| RawArtifact {
            extension: "html".to_string(),
            bytes: html.into_bytes(),
        });
        let pending = figures
            .iter()
            .map(|raw| (raw, ArtifactKind::Figure))
            .chain(html.iter().map(|raw| (raw, ArtifactKind::Html)));

        let mut artifacts = Vec::new();
        for (raw, kind) in pending {
            match self
                .publisher
                .publish(raw, kind, EXECUTE_TOOL, &request.conversation_id)
                .await
            {
                Ok(artifact) => artifacts.push(artifact),
                Err(e) => {
                    for published in &artifacts {
                        self.publisher.discard(published).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(artifacts)
    }

    /// Lock the live conversation for `conversation_id`, creating it if needed.
    /// If it was ended while this request waited, the request moves to the
    /// fresh conversation instead.
    async fn enter_conversation(
        &self,
        conversation_id: &str,
    ) -> (Arc<Conversation>, OwnedMutexGuard<()>) {
        loop {
            let conversation = self.store.get_or_create(conversation_id);
            let lane = conversation.enter().await;
            if self.store.is_current(&conversation) {
                return (conversation, lane);
            }
            tracing::debug!(conversation_id, "Conversation ended while queued");
        }
    }

    /// Like [`Self::enter_conversation`] but never creates one.
    async fn enter_existing(
        &self,
        conversation_id: &str,
    ) -> Option<(Arc<Conversation>, OwnedMutexGuard<()>)> {
        loop {
            let conversation = self.store.get(conversation_id)?;
            let lane = conversation.enter().await;
            if self.store.is_current(&conversation) {
                return Some((conversation, lane));
            }
        }
    }

    /// Record metadata of a freshly loaded dataset, invalidating cache entries
    /// derived from an older version of the same file.
    pub async fn record_dataset_load(
        &self,
        conversation_id: &str,
        report: DatasetReport,
    ) -> EngineResult<DatasetRecord> {
        let (conversation, _lane) = self.enter_conversation(conversation_id).await;
        self.cache.record_dataset_load(&conversation, report)
    }

    /// Run a deterministic analysis tool through the cache and the quota.
    /// A cache hit neither runs `compute` nor consumes quota.
    pub async fn memoize<F, Fut>(
        &self,
        conversation_id: &str,
        tool_name: &str,
        args: &Value,
        compute: F,
    ) -> EngineResult<AnalysisCall>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        let (conversation, _lane) = self.enter_conversation(conversation_id).await;

        if let Some(value) = self.cache.lookup(&conversation, tool_name, args) {
            tracing::debug!(conversation_id, tool_name, "Cache hit");
            return Ok(AnalysisCall::Cached(value));
        }
        if let Admission::Denied(denial) = self.coordinator.admit(&conversation, tool_name) {
            return Ok(AnalysisCall::Denied(denial));
        }
        self.coordinator.charge(&conversation, tool_name);
        let value = compute().await?;
        self.cache.store(&conversation, tool_name, args, value.clone());
        Ok(AnalysisCall::Computed(value))
    }

    /// Explicit reset: the only way a conversation's counters go down.
    pub async fn reset_conversation(&self, conversation_id: &str) -> bool {
        let Some((conversation, _lane)) = self.enter_existing(conversation_id).await else {
            return false;
        };
        conversation.with_state(ConversationExecutionState::reset);
        tracing::info!(conversation_id, "Conversation reset");
        true
    }

    /// Drop every piece of state held for the conversation.
    pub async fn end_conversation(&self, conversation_id: &str) -> bool {
        let Some((conversation, _lane)) = self.enter_existing(conversation_id).await else {
            return false;
        };
        let removed = self.store.remove_current(&conversation);
        tracing::info!(conversation_id, "Conversation ended");
        removed
    }

    pub fn snapshot(&self, conversation_id: &str) -> Option<ConversationExecutionState> {
        self.store
            .get(conversation_id)
            .map(|conversation| conversation.snapshot())
    }

    pub fn conversation_count(&self) -> usize {
        self.store.len()
    }

    /// Stop accepting work and wait for running isolates.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

fn report_label(report: &WorkerReport) -> &'static str {
    match report {
        WorkerReport::Completed { .. } => "completed",
        WorkerReport::Raised { .. } => "raised",
        WorkerReport::TimedOut { .. } => "timed_out",
        WorkerReport::MemoryExceeded => "memory_exceeded",
    }
}
