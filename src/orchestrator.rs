//! Orchestrator
//!
//! Root coordinator. Owns the session registry, runs analysis, planning and
//! composition when a session is created, and carries instructions to
//! domains and orchestration verbs to the executor.
//!
//! ```text
//! Orchestrator
//! ├── sessions: RwLock<id -> Arc<RwLock<OrchestrationSession>>>
//! ├── registry: Arc<DomainRegistry>        (domain plugins)
//! ├── analyzer / planner / composer         (pure, run outside any lock)
//! ├── executor: VerbExecutor                (orchestration verbs)
//! ├── router: DomainRouter                  (instruction -> domains)
//! └── store: Option<Arc<dyn SessionStore>>  (mirror of live sessions)
//! ```
//!
//! ## Locking
//! The registry map and each session have separate locks. Domain plugin
//! calls never run under a session lock: the orchestrator snapshots the
//! domain contexts under a read lock, releases it, calls the plugins, then
//! takes the write lock briefly to accumulate what came back. Callers only
//! ever receive clones of a session.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dsl_types::{ComplianceTier, DomainSessionState, SessionState, WorkflowType};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisInput, ContextAnalyzer};
use crate::attributes::{ConflictStrategy, SyncPlan};
use crate::compatibility::CompatibilityRules;
use crate::composition::{CompositionConfig, CompositionEngine, CompositionRequest};
use crate::config::OrchestratorConfig;
use crate::domains::{DomainContext, DomainError, DomainRegistry, GenerationResponse};
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::executor::{OrchestrationProcessingResult, VerbExecutor};
use crate::planner::ExecutionPlanner;
use crate::routing::{translate_instruction, DomainRouter};
use crate::session::{OrchestrationSession, SessionStatus, SessionSummary, SharedContext};
use crate::store::SessionStore;

type SessionHandle = Arc<RwLock<OrchestrationSession>>;

// ============================================================================
// REQUESTS AND RESULTS
// ============================================================================

/// Parameters for a new orchestration session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Generated when absent
    pub session_id: Option<String>,
    pub cbu_id: Option<String>,
    pub investor_id: Option<String>,
    pub fund_id: Option<String>,
    pub entity_id: Option<String>,
    pub entity_name: String,
    pub entity_type: String,
    pub jurisdiction: String,
    pub products: Vec<String>,
    pub services: Vec<String>,
    pub workflow_type: WorkflowType,
    pub risk_profile: Option<String>,
    pub compliance_tier: Option<ComplianceTier>,
    /// Seeded into the shared context's free-form data
    pub initial_context: BTreeMap<String, Value>,
}

impl CreateSessionRequest {
    pub fn new(
        entity_name: impl Into<String>,
        entity_type: impl Into<String>,
        jurisdiction: impl Into<String>,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            entity_type: entity_type.into(),
            jurisdiction: jurisdiction.into(),
            ..Default::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cbu_id(mut self, cbu_id: impl Into<String>) -> Self {
        self.cbu_id = Some(cbu_id.into());
        self
    }

    pub fn with_investor_id(mut self, investor_id: impl Into<String>) -> Self {
        self.investor_id = Some(investor_id.into());
        self
    }

    pub fn with_products<I, S>(mut self, products: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.products = products.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workflow_type(mut self, workflow_type: WorkflowType) -> Self {
        self.workflow_type = workflow_type;
        self
    }

    pub fn with_risk_profile(mut self, risk_profile: impl Into<String>) -> Self {
        self.risk_profile = Some(risk_profile.into());
        self
    }

    pub fn with_compliance_tier(mut self, tier: ComplianceTier) -> Self {
        self.compliance_tier = Some(tier);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.initial_context.insert(key.into(), value);
        self
    }
}

/// Outcome of carrying one instruction to a set of domains
#[derive(Debug, Clone, Serialize)]
pub struct InstructionResult {
    pub session_id: String,
    pub instruction: String,
    pub success: bool,
    /// In stage order
    pub target_domains: Vec<String>,
    pub domain_results: BTreeMap<String, GenerationResponse>,
    /// Fragments accumulated by this call, joined by a blank line
    pub generated_dsl: String,
    /// Domains whose fragments were accumulated, in accumulation order
    pub processed_domains: Vec<String>,
    pub current_state: SessionState,
    pub version: u64,
    pub unified_dsl: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Point-in-time counters; reading them has no side effects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorMetrics {
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub completed_workflows: u64,
    pub failed_workflows: u64,
    /// domain -> fragments it contributed
    pub domains_coordinated: BTreeMap<String, u64>,
    pub cross_domain_references: u64,
    pub uptime_seconds: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_sessions: AtomicU64,
    completed_workflows: AtomicU64,
    failed_workflows: AtomicU64,
    cross_domain_references: AtomicU64,
    domains_coordinated: Mutex<BTreeMap<String, u64>>,
}

impl MetricsState {
    async fn coordinated(&self, domains: &[String]) {
        if domains.is_empty() {
            return;
        }
        let mut counts = self.domains_coordinated.lock().await;
        for domain in domains {
            *counts.entry(domain.clone()).or_default() += 1;
        }
    }
}

/// What a domain call produced, before it is committed
struct DomainOutcome {
    domain: String,
    result: Result<GenerationResponse, DomainError>,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<DomainRegistry>,
    analyzer: ContextAnalyzer,
    planner: ExecutionPlanner,
    composer: CompositionEngine,
    executor: VerbExecutor,
    router: DomainRouter,
    store: Option<Arc<dyn SessionStore>>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    metrics: MetricsState,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("domains", &self.registry.names())
            .field("executor", &self.executor)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(registry: Arc<DomainRegistry>, config: OrchestratorConfig) -> OrchestrationResult<Self> {
        config.validate()?;
        Ok(Self {
            analyzer: ContextAnalyzer::new(),
            planner: ExecutionPlanner::from_config(&config),
            composer: CompositionEngine::new(CompositionConfig::from(&config)),
            executor: VerbExecutor::default(),
            router: DomainRouter::standard(),
            store: None,
            sessions: RwLock::new(HashMap::new()),
            metrics: MetricsState::default(),
            started_at: Utc::now(),
            registry,
            config,
        })
    }

    /// Mirror every session into `store` and fall back to it on cache misses
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_compatibility(mut self, rules: Arc<dyn CompatibilityRules>) -> Self {
        let vocabulary = Arc::new(self.executor.vocabulary().clone());
        self.executor = VerbExecutor::new(vocabulary, rules);
        self
    }

    pub fn with_executor(mut self, executor: VerbExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_router(mut self, router: DomainRouter) -> Self {
        self.router = router;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &VerbExecutor {
        &self.executor
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Analyse, plan and compose, then register the session. Fails with
    /// `CapacityExceeded` at the configured cap; nothing is registered on
    /// any failure.
    #[instrument(skip(self, request), fields(entity_type = %request.entity_type))]
    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> OrchestrationResult<OrchestrationSession> {
        let now = Utc::now();
        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let analysis = self.analyzer.analyze(&AnalysisInput {
            entity_type: &request.entity_type,
            jurisdiction: &request.jurisdiction,
            products: &request.products,
            workflow_type: request.workflow_type,
            risk_profile: request.risk_profile.as_deref(),
            requested_tier: request.compliance_tier,
        })?;
        let plan = self.planner.plan_at(&analysis, now)?;

        let mut composition = CompositionRequest::new(
            &session_id,
            &request.entity_name,
            &request.entity_type,
            &request.jurisdiction,
            now,
        )
        .with_cbu_id(request.cbu_id.clone().unwrap_or_default())
        .with_products(request.products.iter().cloned());
        composition.workflow_type = request.workflow_type;
        composition.risk_profile = request.risk_profile.clone();
        composition.compliance_tier = request.compliance_tier;
        let composed = self.composer.compose_planned(&composition, &analysis, &plan)?;
        for warning in &composed.warnings {
            warn!(session_id = %session_id, warning = %warning, "composition warning");
        }

        let shared = SharedContext {
            cbu_id: request.cbu_id,
            investor_id: request.investor_id,
            fund_id: request.fund_id,
            entity_id: request.entity_id,
            entity_type: analysis.entity_type.as_str().to_string(),
            entity_name: request.entity_name,
            jurisdiction: request.jurisdiction.trim().to_uppercase(),
            products: request.products,
            services: request.services,
            workflow_type: request.workflow_type,
            risk_profile: request.risk_profile,
            compliance_tier: analysis.compliance_tier,
            attribute_values: BTreeMap::new(),
            data: request.initial_context,
        };
        let session = OrchestrationSession::new(
            session_id.clone(),
            shared,
            analysis,
            plan,
            composed.master_dsl,
            self.config.session_timeout,
            now,
        );
        let snapshot = session.clone();

        {
            let mut sessions = self.sessions.write().await;
            if sessions.len() >= self.config.max_concurrent_sessions {
                warn!(
                    limit = self.config.max_concurrent_sessions,
                    "session rejected, capacity reached"
                );
                return Err(OrchestrationError::CapacityExceeded {
                    limit: self.config.max_concurrent_sessions,
                });
            }
            if sessions.contains_key(&session_id) {
                return Err(OrchestrationError::SessionAlreadyExists { session_id });
            }
            sessions.insert(session_id.clone(), Arc::new(RwLock::new(session)));
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(&snapshot).await {
                self.sessions.write().await.remove(&session_id);
                warn!(session_id = %session_id, error = %e, "session save failed, creation rolled back");
                return Err(e.into());
            }
        }

        self.metrics.total_sessions.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %session_id,
            primary_domain = %snapshot.primary_domain,
            domains = snapshot.active_domains.len(),
            stages = snapshot.execution_plan.total_stages(),
            "orchestration session created"
        );
        Ok(snapshot)
    }

    /// Live handle for a session, loading it from the store on a cache miss.
    /// Expired sessions are reported as not found.
    async fn handle(&self, session_id: &str, now: DateTime<Utc>) -> OrchestrationResult<SessionHandle> {
        let cached = self.sessions.read().await.get(session_id).cloned();
        let handle = match cached {
            Some(handle) => handle,
            None => self.load_from_store(session_id).await?,
        };
        if handle.read().await.is_expired(now) {
            return Err(not_found(session_id));
        }
        Ok(handle)
    }

    async fn load_from_store(&self, session_id: &str) -> OrchestrationResult<SessionHandle> {
        let Some(store) = &self.store else {
            return Err(not_found(session_id));
        };
        let session = match store.load_session(session_id).await {
            Ok(session) => session,
            Err(crate::error::StoreError::NotFound { .. }) => return Err(not_found(session_id)),
            Err(e) => return Err(e.into()),
        };
        if session.is_expired(Utc::now()) {
            return Err(not_found(session_id));
        }

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(session_id) {
            return Ok(existing.clone());
        }
        if sessions.len() >= self.config.max_concurrent_sessions {
            warn!(
                session_id,
                limit = self.config.max_concurrent_sessions,
                "stored session not restored, capacity reached"
            );
            return Err(OrchestrationError::CapacityExceeded {
                limit: self.config.max_concurrent_sessions,
            });
        }
        debug!(session_id, "session restored from store");
        let handle = Arc::new(RwLock::new(session));
        sessions.insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Snapshot of a session. Every read counts as use and pushes the
    /// expiry forward.
    pub async fn get_session(&self, session_id: &str) -> OrchestrationResult<OrchestrationSession> {
        let handle = self.touched(session_id).await?;
        let session = handle.read().await;
        Ok(session.clone())
    }

    pub async fn get_session_status(
        &self,
        session_id: &str,
        include_dsl: bool,
    ) -> OrchestrationResult<SessionStatus> {
        let handle = self.touched(session_id).await?;
        let session = handle.read().await;
        Ok(session.status(include_dsl))
    }

    async fn touched(&self, session_id: &str) -> OrchestrationResult<SessionHandle> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;
        {
            let mut session = handle.write().await;
            session.touch(now);
            self.persist(&session).await;
        }
        Ok(handle)
    }

    /// Unexpired sessions, oldest first. Stored sessions not yet loaded are
    /// included.
    pub async fn list_active_sessions(&self) -> OrchestrationResult<Vec<SessionSummary>> {
        let now = Utc::now();
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            let session = handle.read().await;
            if !session.is_expired(now) {
                summaries.push(session.summary());
            }
        }

        if let Some(store) = &self.store {
            let known: BTreeSet<String> = summaries.iter().map(|s| s.session_id.clone()).collect();
            for id in store.list_active_session_ids(now).await? {
                if known.contains(&id) {
                    continue;
                }
                match store.load_session(&id).await {
                    Ok(session) => summaries.push(session.summary()),
                    Err(e) => warn!(session_id = %id, error = %e, "stored session unreadable"),
                }
            }
        }

        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(summaries)
    }

    /// Returns whether anything was removed
    #[instrument(skip(self))]
    pub async fn delete_session(&self, session_id: &str) -> OrchestrationResult<bool> {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        let stored = match &self.store {
            Some(store) => store.delete_session(session_id).await?,
            None => false,
        };
        if removed || stored {
            info!(session_id, "orchestration session deleted");
        }
        Ok(removed || stored)
    }

    /// Evict every session past its expiry; returns the number removed
    #[instrument(skip(self))]
    pub async fn cleanup_expired_sessions(&self) -> OrchestrationResult<usize> {
        let now = Utc::now();
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        let mut expired = Vec::new();
        let mut live = Vec::new();
        for (id, handle) in handles {
            let mut session = handle.write().await;
            if !session.is_expired(now) {
                live.push(handle.clone());
                continue;
            }
            if session.current_state() != SessionState::Expired {
                session.transition(SessionState::Expired, None, "session timed out", "sweeper", now)?;
            }
            drop(session);
            expired.push((id, handle));
        }

        let mut removed_ids = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            for (id, handle) in expired {
                // Only evict the exact session that was found expired
                if sessions.get(&id).is_some_and(|current| Arc::ptr_eq(current, &handle)) {
                    sessions.remove(&id);
                    removed_ids.push(id);
                }
            }
        }

        let mut removed = removed_ids.len();
        if let Some(store) = &self.store {
            let mut undeleted = 0;
            for id in &removed_ids {
                if let Err(e) = store.delete_session(id).await {
                    warn!(session_id = %id, error = %e, "expired session record not deleted");
                    undeleted += 1;
                }
            }

            // Live records must be current before the store drops what it
            // considers expired
            let mut refreshed = true;
            for handle in &live {
                let session = handle.read().await;
                if let Err(e) = store.save_session(&session).await {
                    warn!(session_id = %session.session_id, error = %e, "live session not refreshed in store");
                    refreshed = false;
                }
            }
            if refreshed {
                match store.cleanup_expired(now).await {
                    // Records left behind above are already counted
                    Ok(count) => removed += count.saturating_sub(undeleted),
                    Err(e) => warn!(error = %e, "store cleanup failed"),
                }
            } else {
                warn!("store cleanup skipped, live sessions could not be refreshed");
            }
        }

        info!(removed, "expired sessions swept");
        Ok(removed)
    }

    /// Make a session look idle for `idle`
    #[doc(hidden)]
    pub async fn backdate_session(&self, session_id: &str, idle: chrono::Duration) -> OrchestrationResult<()> {
        let handle = self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| not_found(session_id))?;
        let mut session = handle.write().await;
        session.backdate(idle);
        self.persist(&session).await;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------------

    /// Route a free-text instruction to the matching domains and accumulate
    /// what they generate. One domain failing does not stop the others;
    /// their fragments are still committed and the failure is reported.
    #[instrument(skip(self, instruction))]
    pub async fn execute_instruction(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> OrchestrationResult<InstructionResult> {
        let started_at = Utc::now();
        let handle = self.handle(session_id, started_at).await?;

        let targets = {
            let session = handle.read().await;
            ensure_open(&session)?;
            self.router.route(instruction, &session)
        };
        self.run_domains(&handle, instruction, targets, false, started_at)
            .await
    }

    /// Run every unfinished domain of the earliest incomplete stage and mark
    /// the ones that succeed as completed
    #[instrument(skip(self, instruction))]
    pub async fn run_next_stage(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> OrchestrationResult<InstructionResult> {
        let started_at = Utc::now();
        let handle = self.handle(session_id, started_at).await?;

        let (targets, stage) = {
            let session = handle.read().await;
            ensure_open(&session)?;
            match session.next_stage() {
                Some(stage) => (
                    stage
                        .domains
                        .iter()
                        .filter(|d| {
                            session
                                .domain(d)
                                .is_some_and(|s| s.state != DomainSessionState::Completed)
                        })
                        .cloned()
                        .collect::<Vec<_>>(),
                    Some(stage.number),
                ),
                None => (Vec::new(), None),
            }
        };

        let Some(stage) = stage else {
            let session = handle.read().await;
            let mut result = empty_result(&session, instruction, started_at);
            result.warnings.push("no pending stage to run".to_string());
            return Ok(result);
        };
        debug!(session_id, stage, domains = ?targets, "running stage");
        self.run_domains(&handle, instruction, targets, true, started_at)
            .await
    }

    async fn run_domains(
        &self,
        handle: &SessionHandle,
        instruction: &str,
        targets: Vec<String>,
        complete: bool,
        started_at: DateTime<Utc>,
    ) -> OrchestrationResult<InstructionResult> {
        // Snapshot contexts, grouped by stage
        let groups: Vec<Vec<(String, DomainContext)>> = {
            let session = handle.read().await;
            let mut by_stage: BTreeMap<usize, Vec<(String, DomainContext)>> = BTreeMap::new();
            for domain in &targets {
                let stage = session.execution_plan.stage_of(domain).unwrap_or(usize::MAX);
                let context = session.build_domain_context(domain)?;
                by_stage.entry(stage).or_default().push((domain.clone(), context));
            }
            by_stage.into_values().collect()
        };

        // No session lock held while domains generate
        let mut outcomes = Vec::with_capacity(targets.len());
        for group in groups {
            if self.config.enable_parallel_execution {
                let calls = group
                    .iter()
                    .map(|(domain, context)| self.generate(domain, instruction, context));
                outcomes.extend(join_all(calls).await);
            } else {
                for (domain, context) in &group {
                    outcomes.push(self.generate(domain, instruction, context).await);
                }
            }
        }

        let now = Utc::now();
        let mut session = handle.write().await;
        let mut result = empty_result(&session, instruction, started_at);
        result.target_domains = targets;
        let mut fragments = Vec::new();
        let was_completed = session.current_state() == SessionState::Completed;

        for outcome in outcomes {
            let response = match outcome.result {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        session_id = %session.session_id,
                        domain = %outcome.domain,
                        error = %e,
                        "domain generation failed"
                    );
                    result
                        .errors
                        .push(format!("domain {} failed: {}", outcome.domain, e));
                    continue;
                }
            };
            if !response.is_valid {
                result.warnings.push(format!(
                    "domain {} returned a fragment it marked invalid",
                    outcome.domain
                ));
            }
            match session.accumulate_dsl(&outcome.domain, &response.fragment, now) {
                Ok(true) => {
                    fragments.push(response.fragment.clone());
                    result.processed_domains.push(outcome.domain.clone());
                }
                Ok(false) => result
                    .warnings
                    .push(format!("domain {} generated no DSL", outcome.domain)),
                Err(e) => {
                    result
                        .errors
                        .push(format!("domain {} failed: {}", outcome.domain, e));
                    result.domain_results.insert(outcome.domain, response);
                    continue;
                }
            }
            if complete {
                if let Err(e) = session.complete_domain(&outcome.domain, instruction, now) {
                    result
                        .errors
                        .push(format!("domain {} failed: {}", outcome.domain, e));
                }
            }
            result.domain_results.insert(outcome.domain, response);
        }

        if !was_completed && session.current_state() == SessionState::Completed {
            self.metrics.completed_workflows.fetch_add(1, Ordering::Relaxed);
        }
        result.generated_dsl = fragments.join("\n\n");
        result.success = result.errors.is_empty();
        result.current_state = session.current_state();
        result.version = session.version_number();
        result.unified_dsl = session.unified_dsl().to_string();
        result.duration_ms = duration_ms(started_at, now);

        self.persist(&session).await;
        drop(session);

        self.metrics.coordinated(&result.processed_domains).await;
        info!(
            session_id = %result.session_id,
            targets = ?result.target_domains,
            accumulated = result.processed_domains.len(),
            errors = result.errors.len(),
            version = result.version,
            "instruction executed"
        );
        Ok(result)
    }

    async fn generate(&self, domain: &str, instruction: &str, context: &DomainContext) -> DomainOutcome {
        let result = match self.registry.require(domain) {
            Err(e) => Err(e),
            Ok(plugin) if !plugin.is_healthy() => Err(DomainError::Unhealthy {
                domain: domain.to_string(),
            }),
            Ok(plugin) => {
                let limit = self.config.generation_timeout;
                match tokio::time::timeout(limit, plugin.generate_dsl(instruction, context)).await {
                    Ok(result) => result,
                    Err(_) => Err(DomainError::Timeout {
                        domain: domain.to_string(),
                        seconds: limit.as_secs(),
                    }),
                }
            }
        };
        DomainOutcome {
            domain: domain.to_string(),
            result,
        }
    }

    /// Execute orchestration verbs. Input starting with `(` is taken as DSL;
    /// anything else must be one of the phrases `translate_instruction`
    /// understands.
    #[instrument(skip(self, instruction))]
    pub async fn execute_orchestration_instruction(
        &self,
        session_id: &str,
        instruction: &str,
    ) -> OrchestrationResult<OrchestrationProcessingResult> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;

        let mut session = handle.write().await;
        ensure_open(&session)?;
        let dsl = if instruction.trim_start().starts_with('(') {
            instruction.to_string()
        } else {
            translate_instruction(instruction, &session)?
        };

        let processing = self
            .executor
            .process_document(&dsl, &mut session, &self.registry, now)?;
        self.persist(&session).await;
        drop(session);

        let references: usize = processing.domain_updates.values().map(Vec::len).sum();
        self.metrics
            .cross_domain_references
            .fetch_add(references as u64, Ordering::Relaxed);
        info!(
            session_id,
            verbs = processing.processed_verbs.len(),
            errors = processing.errors.len(),
            "orchestration instruction executed"
        );
        Ok(processing)
    }

    // ------------------------------------------------------------------------
    // Direct session mutation
    // ------------------------------------------------------------------------

    /// Append a fragment on behalf of `domain`; returns the session version
    #[instrument(skip(self, fragment))]
    pub async fn accumulate_dsl(
        &self,
        session_id: &str,
        domain: &str,
        fragment: &str,
    ) -> OrchestrationResult<u64> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;
        let mut session = handle.write().await;
        let appended = session.accumulate_dsl(domain, fragment, now)?;
        let version = session.version_number();
        if appended {
            self.persist(&session).await;
            debug!(session_id, domain, version, "fragment accumulated");
        }
        Ok(version)
    }

    /// Returns the session state after the domain completed
    #[instrument(skip(self))]
    pub async fn complete_domain(
        &self,
        session_id: &str,
        domain: &str,
        reason: &str,
    ) -> OrchestrationResult<SessionState> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;
        let mut session = handle.write().await;
        if session.complete_domain(domain, reason, now)? {
            self.metrics.completed_workflows.fetch_add(1, Ordering::Relaxed);
            info!(session_id, "orchestration session completed");
        }
        self.persist(&session).await;
        Ok(session.current_state())
    }

    #[instrument(skip(self))]
    pub async fn fail_session(
        &self,
        session_id: &str,
        domain: Option<&str>,
        reason: &str,
    ) -> OrchestrationResult<()> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;
        let mut session = handle.write().await;
        session.fail(domain, reason, now)?;
        self.metrics.failed_workflows.fetch_add(1, Ordering::Relaxed);
        warn!(session_id, domain = ?domain, reason, "orchestration session failed");
        self.persist(&session).await;
        Ok(())
    }

    /// Write an attribute value and plan its propagation
    #[instrument(skip(self, value))]
    pub async fn update_attribute(
        &self,
        session_id: &str,
        attribute_id: &str,
        value: &str,
        source_domain: &str,
        strategy: ConflictStrategy,
    ) -> OrchestrationResult<Option<SyncPlan>> {
        let now = Utc::now();
        let handle = self.handle(session_id, now).await?;
        let mut session = handle.write().await;
        let plan = session.update_attribute(attribute_id, value, source_domain, strategy, now)?;
        if let Some(plan) = &plan {
            self.metrics
                .cross_domain_references
                .fetch_add(plan.targets.len() as u64, Ordering::Relaxed);
        }
        self.persist(&session).await;
        Ok(plan)
    }

    // ------------------------------------------------------------------------
    // Metrics and persistence
    // ------------------------------------------------------------------------

    /// `active_sessions` counts unexpired sessions held in memory
    pub async fn get_metrics(&self) -> OrchestratorMetrics {
        let now = Utc::now();
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut active_sessions = 0;
        for handle in handles {
            if !handle.read().await.is_expired(now) {
                active_sessions += 1;
            }
        }
        OrchestratorMetrics {
            total_sessions: self.metrics.total_sessions.load(Ordering::Relaxed),
            active_sessions,
            completed_workflows: self.metrics.completed_workflows.load(Ordering::Relaxed),
            failed_workflows: self.metrics.failed_workflows.load(Ordering::Relaxed),
            domains_coordinated: self.metrics.domains_coordinated.lock().await.clone(),
            cross_domain_references: self.metrics.cross_domain_references.load(Ordering::Relaxed),
            uptime_seconds: (now - self.started_at).num_seconds(),
            last_updated: now,
        }
    }

    /// Save the full record; failures are logged, not returned
    async fn persist(&self, session: &OrchestrationSession) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_session(session).await {
                warn!(session_id = %session.session_id, error = %e, "session save failed");
            }
        }
    }
}

fn not_found(session_id: &str) -> OrchestrationError {
    OrchestrationError::SessionNotFound {
        session_id: session_id.to_string(),
    }
}

fn ensure_open(session: &OrchestrationSession) -> OrchestrationResult<()> {
    if session.current_state().is_terminal() {
        return Err(OrchestrationError::InvalidTransition {
            session_id: session.session_id.clone(),
            from: session.current_state().to_string(),
            to: SessionState::Active.to_string(),
        });
    }
    Ok(())
}

fn empty_result(
    session: &OrchestrationSession,
    instruction: &str,
    started_at: DateTime<Utc>,
) -> InstructionResult {
    InstructionResult {
        session_id: session.session_id.clone(),
        instruction: instruction.to_string(),
        success: true,
        target_domains: Vec::new(),
        domain_results: BTreeMap::new(),
        generated_dsl: String::new(),
        processed_domains: Vec::new(),
        current_state: session.current_state(),
        version: session.version_number(),
        unified_dsl: session.unified_dsl().to_string(),
        errors: Vec::new(),
        warnings: Vec::new(),
        started_at,
        duration_ms: duration_ms(started_at, Utc::now()),
    }
}

fn duration_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}
