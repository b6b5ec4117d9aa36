//! Orchestration Session
//!
//! The unit of work for one onboarding case: shared context, execution plan,
//! one sub-session per planned domain, the accumulated DSL document and an
//! append-only state history.
//!
//! ```text
//! OrchestrationSession
//! ├── session_id, primary_domain, current_state, version_number
//! ├── shared_context: SharedContext (case data + attribute values)
//! ├── analysis / execution_plan
//! ├── active_domains: domain -> DomainSession
//! ├── master_dsl (composed at creation)
//! ├── unified_dsl (append-only, one entry per accumulation)
//! ├── entity_refs / attribute_refs / attributes
//! └── state_history: Vec<StateTransition>
//! ```
//!
//! Sessions live behind a per-session lock owned by the orchestrator.
//! Callers only ever receive clones, so the invariants below can only be
//! changed through the methods on this type:
//!
//! - `version_number` counts successful non-empty accumulations
//! - `unified_dsl` is only ever appended to
//! - every key of `active_domains` is a planned domain
//! - `expires_at == last_used + timeout`

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use dsl_types::{
    ComplianceTier, ContextAnalysis, DomainSessionState, ExecutionPlan, ExecutionStage,
    SessionState, StageState, StateTransition, WorkflowType,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::attributes::{AttributeValue, ConflictStrategy, CrossDomainAttributeManager, SyncPlan};
use crate::domains::DomainContext;
use crate::error::{OrchestrationError, OrchestrationResult};

/// Pseudo-domain that owns fragments produced by orchestration verbs
pub const ORCHESTRATION_DOMAIN: &str = "orchestration";

const ORCHESTRATOR_ACTOR: &str = "orchestrator";

// ============================================================================
// SHARED AND PER-DOMAIN STATE
// ============================================================================

/// Case data visible to every domain of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cbu_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    pub entity_type: String,
    pub entity_name: String,
    pub jurisdiction: String,
    pub products: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,

    pub workflow_type: WorkflowType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_profile: Option<String>,
    pub compliance_tier: ComplianceTier,

    /// attribute id -> current value
    #[serde(default)]
    pub attribute_values: BTreeMap<String, AttributeValue>,

    /// Free-form auxiliary data
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

/// One domain's sub-session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSession {
    pub domain: String,
    /// Domain-local session id
    pub session_id: String,
    pub state: DomainSessionState,
    /// Domain-specific context merged into every generation call
    pub context: BTreeMap<String, Value>,
    /// Last fragment this domain contributed
    pub contributed_dsl: String,
    pub last_activity: DateTime<Utc>,
    /// Domains this one waits on
    pub dependencies: Vec<String>,
}

/// A side effect produced by an orchestration verb. Verbs never touch the
/// session directly; the orchestrator applies their mutations in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMutation {
    InitializeContext {
        cbu_id: String,
        entity_name: String,
        entity_type: String,
        jurisdiction: String,
        products: Vec<String>,
    },
    RegisterAttribute {
        attribute_id: String,
        domains: Vec<String>,
    },
    SetEntityRef {
        name: String,
        value: String,
    },
    SetAttributeRef {
        name: String,
        attribute_id: String,
    },
    SetDomainState {
        domain: String,
        state: DomainSessionState,
    },
    SetDomainContext {
        domain: String,
        key: String,
        value: Value,
    },
    AddNextAction {
        action: String,
    },
    SetData {
        key: String,
        value: Value,
    },
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSession {
    pub session_id: String,
    pub primary_domain: String,
    current_state: SessionState,
    version_number: u64,

    pub shared_context: SharedContext,
    pub analysis: ContextAnalysis,
    pub execution_plan: ExecutionPlan,
    pub active_domains: BTreeMap<String, DomainSession>,
    /// domain -> latest contributed fragment
    pub domain_dsl: BTreeMap<String, String>,

    /// Document composed when the session was created
    pub master_dsl: String,
    unified_dsl: String,

    pub entity_refs: BTreeMap<String, String>,
    pub attribute_refs: BTreeMap<String, String>,
    pub attributes: CrossDomainAttributeManager,
    /// Actions verbs asked the caller to poll or await
    pub next_actions: Vec<String>,

    state_history: Vec<StateTransition>,

    timeout_ms: i64,
    created_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl OrchestrationSession {
    /// Build a session with one CREATED sub-session per planned domain
    pub fn new(
        session_id: impl Into<String>,
        shared_context: SharedContext,
        analysis: ContextAnalysis,
        execution_plan: ExecutionPlan,
        master_dsl: impl Into<String>,
        timeout: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let session_id = session_id.into();
        let dependencies = &execution_plan.dependencies;
        let active_domains = execution_plan
            .stages
            .iter()
            .flat_map(|stage| {
                stage.domains.iter().map(move |domain| {
                    let mut context = BTreeMap::new();
                    context.insert("stage".to_string(), json!(stage.number));
                    (
                        domain.clone(),
                        DomainSession {
                            domain: domain.clone(),
                            session_id: Uuid::new_v4().to_string(),
                            state: DomainSessionState::Created,
                            context,
                            contributed_dsl: String::new(),
                            last_activity: now,
                            dependencies: dependencies
                                .get(domain)
                                .cloned()
                                .unwrap_or_default(),
                        },
                    )
                })
            })
            .collect();

        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let mut session = Self {
            primary_domain: analysis.primary_domain.clone(),
            session_id,
            current_state: SessionState::Created,
            version_number: 0,
            shared_context,
            analysis,
            execution_plan,
            active_domains,
            domain_dsl: BTreeMap::new(),
            master_dsl: master_dsl.into(),
            unified_dsl: String::new(),
            entity_refs: BTreeMap::new(),
            attribute_refs: BTreeMap::new(),
            attributes: CrossDomainAttributeManager::new(),
            next_actions: Vec::new(),
            state_history: Vec::new(),
            timeout_ms,
            created_at: now,
            last_used: now,
            expires_at: now,
        };
        session.touch(now);
        session.state_history.push(StateTransition {
            from_state: None,
            to_state: SessionState::Created,
            domain: None,
            reason: format!(
                "session created with {} domains in {} stages",
                session.active_domains.len(),
                session.execution_plan.total_stages()
            ),
            generated_by: ORCHESTRATOR_ACTOR.to_string(),
            timestamp: now,
        });
        session
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn current_state(&self) -> SessionState {
        self.current_state
    }

    pub fn version_number(&self) -> u64 {
        self.version_number
    }

    pub fn unified_dsl(&self) -> &str {
        &self.unified_dsl
    }

    pub fn state_history(&self) -> &[StateTransition] {
        &self.state_history
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        self.last_used
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn timeout(&self) -> Duration {
        Duration::milliseconds(self.timeout_ms)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Refresh `last_used` and push the expiry forward
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used = now;
        self.expires_at = now
            .checked_add_signed(self.timeout())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Move `last_used` into the past, as if the session had been idle
    #[doc(hidden)]
    pub fn backdate(&mut self, idle: Duration) {
        let last_used = self
            .last_used
            .checked_sub_signed(idle)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.touch(last_used);
    }

    /// Bring a stored record's document up to `version`. Equal or older
    /// versions are ignored, so late writes cannot roll a record back.
    pub(crate) fn apply_persisted_dsl(&mut self, unified_dsl: &str, version: u64) -> bool {
        if version <= self.version_number {
            return false;
        }
        self.unified_dsl = unified_dsl.to_string();
        self.version_number = version;
        true
    }

    pub fn domain(&self, domain: &str) -> Option<&DomainSession> {
        self.active_domains.get(domain)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.execution_plan.domains()
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn ensure_mutable(&self) -> OrchestrationResult<()> {
        if self.current_state.is_terminal() {
            return Err(OrchestrationError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: self.current_state.to_string(),
                to: SessionState::Active.to_string(),
            });
        }
        Ok(())
    }

    fn require_domain(&self, domain: &str) -> OrchestrationResult<()> {
        if domain == ORCHESTRATION_DOMAIN || self.active_domains.contains_key(domain) {
            Ok(())
        } else {
            Err(OrchestrationError::DomainNotInSession {
                session_id: self.session_id.clone(),
                domain: domain.to_string(),
            })
        }
    }

    /// Record a state change. History is never rewritten.
    pub fn transition(
        &mut self,
        to: SessionState,
        domain: Option<&str>,
        reason: impl Into<String>,
        generated_by: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        let from = self.current_state;
        if !from.can_transition_to(to) {
            return Err(OrchestrationError::InvalidTransition {
                session_id: self.session_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let reason = reason.into();
        debug!(session_id = %self.session_id, %from, %to, %reason, "session transition");
        self.current_state = to;
        self.state_history.push(StateTransition {
            from_state: Some(from),
            to_state: to,
            domain: domain.map(str::to_string),
            reason,
            generated_by: generated_by.to_string(),
            timestamp: now,
        });
        Ok(())
    }

    fn activate(&mut self, domain: &str, reason: &str, now: DateTime<Utc>) -> OrchestrationResult<()> {
        if self.current_state == SessionState::Created {
            self.transition(SessionState::Active, Some(domain), reason, ORCHESTRATOR_ACTOR, now)?;
        }
        Ok(())
    }

    /// Append a fragment to the unified document. A fragment with no content
    /// counts as empty, so whitespace-only input is a no-op like `""` and
    /// leaves the version untouched. Returns whether anything was appended.
    pub fn accumulate_dsl(
        &mut self,
        domain: &str,
        fragment: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<bool> {
        if fragment.trim().is_empty() {
            return Ok(false);
        }
        self.ensure_mutable()?;
        self.require_domain(domain)?;

        self.activate(domain, "first DSL fragment accumulated", now)?;
        if !self.unified_dsl.is_empty() {
            self.unified_dsl.push_str("\n\n");
        }
        self.unified_dsl.push_str(fragment);
        self.version_number += 1;
        self.domain_dsl.insert(domain.to_string(), fragment.to_string());

        if let Some(domain_session) = self.active_domains.get_mut(domain) {
            domain_session.contributed_dsl = fragment.to_string();
            domain_session.last_activity = now;
            if domain_session.state == DomainSessionState::Created {
                domain_session.state = DomainSessionState::Running;
            }
        }
        self.refresh_stage_states();
        self.touch(now);
        Ok(true)
    }

    /// Mark a domain finished. Returns true when this completed the session.
    pub fn complete_domain(
        &mut self,
        domain: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<bool> {
        self.ensure_mutable()?;
        let domain_session = self.active_domains.get_mut(domain).ok_or_else(|| {
            OrchestrationError::DomainNotInSession {
                session_id: self.session_id.clone(),
                domain: domain.to_string(),
            }
        })?;
        domain_session.state = DomainSessionState::Completed;
        domain_session.last_activity = now;
        debug!(session_id = %self.session_id, domain, reason, "domain completed");

        self.refresh_stage_states();
        self.touch(now);

        let all_done = self
            .active_domains
            .values()
            .all(|d| d.state == DomainSessionState::Completed);
        if all_done {
            self.activate(domain, "domain work started", now)?;
            self.transition(
                SessionState::Completed,
                Some(domain),
                "all domains completed",
                ORCHESTRATOR_ACTOR,
                now,
            )?;
        }
        Ok(all_done)
    }

    /// Unrecoverable failure. The session keeps its DSL and history.
    pub fn fail(
        &mut self,
        domain: Option<&str>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        self.ensure_mutable()?;
        if let Some(domain) = domain {
            self.require_domain(domain)?;
        }
        self.transition(SessionState::Failed, domain, reason, ORCHESTRATOR_ACTOR, now)?;
        if let Some(domain_session) = domain.and_then(|d| self.active_domains.get_mut(d)) {
            domain_session.state = DomainSessionState::Failed;
            domain_session.last_activity = now;
        }
        self.refresh_stage_states();
        self.touch(now);
        Ok(())
    }

    fn refresh_stage_states(&mut self) {
        let domains = &self.active_domains;
        for stage in &mut self.execution_plan.stages {
            let states: Vec<DomainSessionState> = stage
                .domains
                .iter()
                .filter_map(|d| domains.get(d).map(|s| s.state))
                .collect();
            stage.state = if states.iter().any(|s| *s == DomainSessionState::Failed) {
                StageState::Failed
            } else if states.iter().all(|s| *s == DomainSessionState::Completed) {
                StageState::Completed
            } else if states.iter().any(|s| *s != DomainSessionState::Created) {
                StageState::Running
            } else {
                StageState::Pending
            };
        }
    }

    /// Earliest stage with a domain that has not completed
    pub fn next_stage(&self) -> Option<&ExecutionStage> {
        self.execution_plan.stages.iter().find(|stage| {
            stage.domains.iter().any(|d| {
                self.active_domains
                    .get(d)
                    .is_some_and(|s| s.state != DomainSessionState::Completed)
            })
        })
    }

    // ------------------------------------------------------------------------
    // Verb side effects and attributes
    // ------------------------------------------------------------------------

    /// Apply a verb's mutations as one unit
    pub fn apply_mutations(
        &mut self,
        mutations: &[SessionMutation],
        now: DateTime<Utc>,
    ) -> OrchestrationResult<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        self.ensure_mutable()?;

        for mutation in mutations {
            match mutation {
                SessionMutation::InitializeContext {
                    cbu_id,
                    entity_name,
                    entity_type,
                    jurisdiction,
                    products,
                } => {
                    self.shared_context.cbu_id = Some(cbu_id.clone());
                    self.shared_context.entity_name = entity_name.clone();
                    self.shared_context.entity_type = entity_type.clone();
                    self.shared_context.jurisdiction = jurisdiction.clone();
                    self.shared_context.products = products.clone();
                }
                SessionMutation::RegisterAttribute {
                    attribute_id,
                    domains,
                } => {
                    self.attributes
                        .register_all(attribute_id, domains.iter().map(String::as_str));
                }
                SessionMutation::SetEntityRef { name, value } => {
                    self.entity_refs.insert(name.clone(), value.clone());
                }
                SessionMutation::SetAttributeRef { name, attribute_id } => {
                    self.attribute_refs.insert(name.clone(), attribute_id.clone());
                }
                SessionMutation::SetDomainState { domain, state } => {
                    match self.active_domains.get_mut(domain) {
                        Some(domain_session) => {
                            domain_session.state = *state;
                            domain_session.last_activity = now;
                        }
                        None => warn!(
                            session_id = %self.session_id,
                            domain = %domain,
                            "state change for unknown domain ignored"
                        ),
                    }
                }
                SessionMutation::SetDomainContext { domain, key, value } => {
                    if let Some(domain_session) = self.active_domains.get_mut(domain) {
                        domain_session.context.insert(key.clone(), value.clone());
                    }
                }
                SessionMutation::AddNextAction { action } => {
                    if !self.next_actions.contains(action) {
                        self.next_actions.push(action.clone());
                    }
                }
                SessionMutation::SetData { key, value } => {
                    self.shared_context.data.insert(key.clone(), value.clone());
                }
            }
        }

        self.refresh_stage_states();
        self.touch(now);
        Ok(())
    }

    /// Write an attribute value from `source_domain`, resolving against the
    /// current value and planning propagation to the other domains that
    /// reference it.
    pub fn update_attribute(
        &mut self,
        attribute_id: &str,
        value: &str,
        source_domain: &str,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<Option<SyncPlan>> {
        self.ensure_mutable()?;
        self.require_domain(source_domain)?;

        let incoming = AttributeValue::new(value, source_domain, now);
        let current = self.shared_context.attribute_values.get(attribute_id).cloned();
        let plan = self
            .attributes
            .plan_sync(attribute_id, current.as_ref(), &incoming, strategy);
        let resolved = match &plan {
            Some(plan) => plan.resolved.clone(),
            None => CrossDomainAttributeManager::resolve(strategy, current.as_ref(), &incoming),
        };
        self.shared_context
            .attribute_values
            .insert(attribute_id.to_string(), resolved);
        self.touch(now);
        Ok(plan)
    }

    /// Snapshot of everything a domain needs for one generation call
    pub fn build_domain_context(&self, domain: &str) -> OrchestrationResult<DomainContext> {
        let domain_session = self.active_domains.get(domain).ok_or_else(|| {
            OrchestrationError::DomainNotInSession {
                session_id: self.session_id.clone(),
                domain: domain.to_string(),
            }
        })?;
        let shared = &self.shared_context;

        let mut context = DomainContext::new(domain, &self.session_id)
            .with_domain_session(&domain_session.session_id, domain_session.state.as_str());

        let optional = [
            ("cbu_id", &shared.cbu_id),
            ("investor_id", &shared.investor_id),
            ("fund_id", &shared.fund_id),
            ("entity_id", &shared.entity_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                context.insert(key, json!(value));
            }
        }
        context.insert("entity_type", json!(shared.entity_type));
        context.insert("entity_name", json!(shared.entity_name));
        context.insert("jurisdiction", json!(shared.jurisdiction));
        context.insert("products", json!(shared.products));
        context.insert("services", json!(shared.services));
        context.insert("workflow_type", json!(shared.workflow_type.as_str()));
        if let Some(risk) = &shared.risk_profile {
            context.insert("risk_profile", json!(risk));
        }
        context.insert("compliance_tier", json!(shared.compliance_tier.as_str()));

        for (attribute_id, value) in &shared.attribute_values {
            context.insert(attribute_id.clone(), json!(value.value));
        }
        for (key, value) in &shared.data {
            context.insert(key.clone(), value.clone());
        }
        for (key, value) in &domain_session.context {
            context.insert(key.clone(), value.clone());
        }
        for (ref_type, ref_id) in &self.entity_refs {
            context.insert(format!("{}_ref", ref_type), json!(ref_id));
        }
        Ok(context)
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    pub fn status(&self, include_dsl: bool) -> SessionStatus {
        let active_domains = self
            .execution_plan
            .domains()
            .iter()
            .filter_map(|d| self.active_domains.get(d))
            .map(|d| DomainStatus {
                domain: d.domain.clone(),
                state: d.state,
                has_dsl: !d.contributed_dsl.is_empty(),
                last_activity: d.last_activity,
                dependencies: d.dependencies.clone(),
            })
            .collect();

        SessionStatus {
            session_id: self.session_id.clone(),
            primary_domain: self.primary_domain.clone(),
            current_state: self.current_state,
            version: self.version_number,
            active_domains,
            stages: self.execution_plan.stages.clone(),
            next_actions: self.next_actions.clone(),
            created_at: self.created_at,
            last_used: self.last_used,
            expires_at: self.expires_at,
            unified_dsl_size: self.unified_dsl.len(),
            unified_dsl: include_dsl.then(|| self.unified_dsl.clone()),
        }
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            primary_domain: self.primary_domain.clone(),
            current_state: self.current_state,
            version: self.version_number,
            domain_count: self.active_domains.len(),
            created_at: self.created_at,
            last_used: self.last_used,
        }
    }
}

/// Per-domain line of a [`SessionStatus`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: String,
    pub state: DomainSessionState,
    pub has_dsl: bool,
    pub last_activity: DateTime<Utc>,
    pub dependencies: Vec<String>,
}

/// Detailed read-only view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub primary_domain: String,
    pub current_state: SessionState,
    pub version: u64,
    /// Stage order
    pub active_domains: Vec<DomainStatus>,
    pub stages: Vec<ExecutionStage>,
    pub next_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub unified_dsl_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unified_dsl: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub primary_domain: String,
    pub current_state: SessionState,
    pub version: u64,
    pub domain_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisInput, ContextAnalyzer};
    use crate::planner::ExecutionPlanner;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn session(entity_type: &str, jurisdiction: &str, products: &[&str]) -> OrchestrationSession {
        let products: Vec<String> = products.iter().map(|p| p.to_string()).collect();
        let analysis = ContextAnalyzer::new()
            .analyze(&AnalysisInput {
                entity_type,
                jurisdiction,
                products: &products,
                ..Default::default()
            })
            .unwrap();
        let plan = ExecutionPlanner::default().plan_at(&analysis, now()).unwrap();
        let shared = SharedContext {
            entity_type: entity_type.to_string(),
            entity_name: "Acme Holdings".to_string(),
            jurisdiction: jurisdiction.to_string(),
            products: products.clone(),
            compliance_tier: analysis.compliance_tier,
            ..Default::default()
        };
        OrchestrationSession::new(
            "session-1",
            shared,
            analysis,
            plan,
            "(orchestration.session.initialize)",
            std::time::Duration::from_secs(3600),
            now(),
        )
    }

    #[test]
    fn test_new_session_has_one_subsession_per_planned_domain() {
        let s = session("CORPORATE", "US", &["CUSTODY"]);
        assert_eq!(s.current_state(), SessionState::Created);
        assert_eq!(s.version_number(), 0);
        assert!(s.unified_dsl().is_empty());
        for domain in s.active_domains.keys() {
            assert!(s.execution_plan.contains(domain));
        }
        assert_eq!(s.active_domains.len(), s.execution_plan.domains().len());
        assert_eq!(s.state_history().len(), 1);
        assert_eq!(s.expires_at(), now() + Duration::hours(1));
    }

    #[test]
    fn test_accumulation_appends_and_versions() {
        let mut s = session("CORPORATE", "US", &["CUSTODY"]);

        assert!(!s.accumulate_dsl("kyc", "   \n", now()).unwrap());
        assert_eq!(s.version_number(), 0);

        assert!(s.accumulate_dsl("kyc", "(kyc.start)", now()).unwrap());
        assert_eq!(s.current_state(), SessionState::Active);
        assert!(s.accumulate_dsl("custody", "(custody.open.account)", now()).unwrap());

        assert_eq!(s.version_number(), 2);
        assert_eq!(s.unified_dsl(), "(kyc.start)\n\n(custody.open.account)");
        assert_eq!(s.domain_dsl["custody"], "(custody.open.account)");
        assert_eq!(s.active_domains["kyc"].state, DomainSessionState::Running);

        let err = s.accumulate_dsl("trading", "(trade)", now()).unwrap_err();
        assert!(matches!(err, OrchestrationError::DomainNotInSession { .. }));
        assert_eq!(s.version_number(), 2);
    }

    #[test]
    fn test_completing_every_domain_completes_session() {
        let mut s = session("INDIVIDUAL", "", &["HEDGE_FUND_INVESTMENT"]);
        let domains = s.domain_names();
        let (last, rest) = domains.split_last().unwrap();
        for domain in rest {
            assert!(!s.complete_domain(domain, "done", now()).unwrap());
        }
        assert!(s.complete_domain(last, "done", now()).unwrap());
        assert_eq!(s.current_state(), SessionState::Completed);
        assert!(s.next_stage().is_none());
        assert!(s
            .execution_plan
            .stages
            .iter()
            .all(|stage| stage.state == StageState::Completed));

        let states: Vec<SessionState> = s.state_history().iter().map(|t| t.to_state).collect();
        assert_eq!(
            states,
            vec![SessionState::Created, SessionState::Active, SessionState::Completed]
        );

        let err = s.accumulate_dsl("kyc", "(kyc.start)", now()).unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    }

    #[test]
    fn test_failure_is_terminal_and_keeps_audit_trail() {
        let mut s = session("CORPORATE", "GB", &["CUSTODY"]);
        s.accumulate_dsl("kyc", "(kyc.start)", now()).unwrap();
        s.fail(Some("kyc"), "sanctions hit", now()).unwrap();

        assert_eq!(s.current_state(), SessionState::Failed);
        assert_eq!(s.unified_dsl(), "(kyc.start)");
        assert_eq!(s.state_history().last().unwrap().reason, "sanctions hit");
        assert!(s.fail(None, "again", now()).is_err());
        assert!(s
            .apply_mutations(
                &[SessionMutation::AddNextAction {
                    action: "retry".to_string()
                }],
                now()
            )
            .is_err());
    }

    #[test]
    fn test_backdated_session_is_expired() {
        let mut s = session("CORPORATE", "US", &[]);
        assert!(!s.is_expired(now()));
        s.backdate(Duration::hours(2));
        assert!(s.is_expired(now()));
        s.touch(now());
        assert!(!s.is_expired(now()));
    }

    #[test]
    fn test_domain_context_layers_shared_data() {
        let mut s = session("CORPORATE", "US", &["CUSTODY"]);
        s.apply_mutations(
            &[
                SessionMutation::SetEntityRef {
                    name: "entity".to_string(),
                    value: "entity.primary.id".to_string(),
                },
                SessionMutation::SetData {
                    key: "risk_rating".to_string(),
                    value: json!("HIGH"),
                },
            ],
            now(),
        )
        .unwrap();
        s.update_attribute("entity.legal_name", "Acme Holdings Inc", "kyc", ConflictStrategy::SourceWins, now())
            .unwrap();

        let ctx = s.build_domain_context("kyc").unwrap();
        assert_eq!(ctx.get_str("entity_name"), Some("Acme Holdings"));
        assert_eq!(ctx.get_str("entity_ref"), Some("entity.primary.id"));
        assert_eq!(ctx.get_str("risk_rating"), Some("HIGH"));
        assert_eq!(ctx.get_str("entity.legal_name"), Some("Acme Holdings Inc"));
        assert!(ctx.contains("stage"));
        assert!(!ctx.contains("cbu_id"));
        assert!(s.build_domain_context("trading").is_err());
    }

    #[test]
    fn test_attribute_update_plans_sync_for_shared_attributes() {
        let mut s = session("CORPORATE", "US", &["CUSTODY"]);
        s.apply_mutations(
            &[SessionMutation::RegisterAttribute {
                attribute_id: "entity.address".to_string(),
                domains: vec!["kyc".to_string(), "custody".to_string()],
            }],
            now(),
        )
        .unwrap();

        let plan = s
            .update_attribute("entity.address", "1 Main St", "kyc", ConflictStrategy::SourceWins, now())
            .unwrap()
            .unwrap();
        assert_eq!(plan.targets, vec!["custody"]);
        assert_eq!(
            s.shared_context.attribute_values["entity.address"].value,
            "1 Main St"
        );
    }
}
