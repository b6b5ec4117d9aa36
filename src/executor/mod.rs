//! Orchestration Verb Executor
//!
//! Interprets the closed orchestration vocabulary against a live session.
//!
//! ## Execution model
//! - The verb is looked up in the [`OrchestrationVocabulary`] and its
//!   required parameters are checked before anything else runs
//! - Dispatch goes through the verb's [`VerbCategory`] to a category
//!   handler in [`handlers`]
//! - Handlers are pure: they read an [`ExecutionContext`] and return a
//!   [`VerbExecutionResult`] carrying the generated fragment and a list of
//!   [`SessionMutation`]s
//! - [`VerbExecutor::process_document`] applies each verb's mutations and
//!   fragment in one step, so a failing verb leaves the session untouched

pub mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compatibility::{CompatibilityRules, PermissiveCompatibility};
use crate::domains::DomainRegistry;
use crate::dsl::VerbForm;
use crate::error::{OrchestrationResult, VerbError};
use crate::session::{OrchestrationSession, SessionMutation, ORCHESTRATION_DOMAIN};
use crate::vocabulary::{OrchestrationVocabulary, VerbCategory};

/// Everything a verb handler may read
pub struct ExecutionContext<'a> {
    pub session: &'a OrchestrationSession,
    pub registry: &'a DomainRegistry,
    pub vocabulary: &'a OrchestrationVocabulary,
    pub compatibility: &'a dyn CompatibilityRules,
    /// Timestamp written into generated fragments
    pub now: DateTime<Utc>,
    /// Advisory ceiling for long-running generation
    pub max_duration: Duration,
}

/// Uniform outcome of one verb
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerbExecutionResult {
    pub verb: String,
    pub success: bool,
    pub result_data: BTreeMap<String, Value>,
    pub generated_dsl: String,
    pub next_actions: Vec<String>,
    pub attribute_refs: Vec<String>,
    /// domain -> what was asked of it
    pub domain_updates: BTreeMap<String, String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub mutations: Vec<SessionMutation>,
}

impl VerbExecutionResult {
    pub fn new(verb: &str) -> Self {
        Self {
            verb: verb.to_string(),
            success: true,
            ..Default::default()
        }
    }

    pub fn with_dsl(mut self, dsl: String) -> Self {
        self.generated_dsl = dsl;
        self
    }

    pub fn data(&mut self, key: &str, value: impl Into<Value>) {
        self.result_data.insert(key.to_string(), value.into());
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn mutate(&mut self, mutation: SessionMutation) {
        self.mutations.push(mutation);
    }
}

/// Aggregate of every verb in one orchestration document
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestrationProcessingResult {
    pub session_id: String,
    pub success: bool,
    pub processed_verbs: Vec<String>,
    pub generated_dsl: Vec<String>,
    pub domain_updates: BTreeMap<String, Vec<String>>,
    pub next_actions: Vec<String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl OrchestrationProcessingResult {
    fn merge(&mut self, result: VerbExecutionResult) {
        self.processed_verbs.push(result.verb);
        if !result.generated_dsl.trim().is_empty() {
            self.generated_dsl.push(result.generated_dsl);
        }
        for (domain, update) in result.domain_updates {
            self.domain_updates.entry(domain).or_default().push(update);
        }
        for action in result.next_actions {
            if !self.next_actions.contains(&action) {
                self.next_actions.push(action);
            }
        }
        self.errors.extend(result.errors);
        self.warnings.extend(result.warnings);
    }
}

type CategoryHandler = fn(&VerbForm, &str, &ExecutionContext<'_>) -> Result<VerbExecutionResult, VerbError>;

fn handler_for(category: VerbCategory) -> CategoryHandler {
    match category {
        VerbCategory::Context => handlers::context,
        VerbCategory::State => handlers::state,
        VerbCategory::Workflow => handlers::workflow,
        VerbCategory::Communication => handlers::communication,
        VerbCategory::Product => handlers::product,
    }
}

#[derive(Clone)]
pub struct VerbExecutor {
    vocabulary: Arc<OrchestrationVocabulary>,
    compatibility: Arc<dyn CompatibilityRules>,
    max_duration: Duration,
}

impl Default for VerbExecutor {
    fn default() -> Self {
        Self::new(
            Arc::new(OrchestrationVocabulary::standard()),
            Arc::new(PermissiveCompatibility),
        )
    }
}

impl std::fmt::Debug for VerbExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerbExecutor")
            .field("verbs", &self.vocabulary.len())
            .field("compatibility", &self.compatibility.name())
            .field("max_duration", &self.max_duration)
            .finish()
    }
}

impl VerbExecutor {
    pub fn new(
        vocabulary: Arc<OrchestrationVocabulary>,
        compatibility: Arc<dyn CompatibilityRules>,
    ) -> Self {
        Self {
            vocabulary,
            compatibility,
            max_duration: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn vocabulary(&self) -> &OrchestrationVocabulary {
        &self.vocabulary
    }

    pub fn compatibility(&self) -> &dyn CompatibilityRules {
        self.compatibility.as_ref()
    }

    pub fn context<'a>(
        &'a self,
        session: &'a OrchestrationSession,
        registry: &'a DomainRegistry,
        now: DateTime<Utc>,
    ) -> ExecutionContext<'a> {
        ExecutionContext {
            session,
            registry,
            vocabulary: &self.vocabulary,
            compatibility: self.compatibility.as_ref(),
            now,
            max_duration: self.max_duration,
        }
    }

    /// Execute one verb without touching the session
    pub fn execute(
        &self,
        form: &VerbForm,
        ctx: &ExecutionContext<'_>,
    ) -> Result<VerbExecutionResult, VerbError> {
        let definition = ctx
            .vocabulary
            .get(&form.verb)
            .ok_or_else(|| VerbError::UnknownVerb {
                verb: form.verb.clone(),
                line: form.line,
            })?;

        // A key given with no values counts as missing
        let missing: Vec<&str> = definition
            .required_parameters()
            .filter(|key| form.values(key).is_none_or(|values| values.is_empty()))
            .collect();
        if !missing.is_empty() {
            return Err(VerbError::MissingParameters {
                verb: definition.name.to_string(),
                missing: missing.join(", "),
            });
        }

        let mut result = handler_for(definition.category)(form, definition.name, ctx)?;
        for action in &result.next_actions {
            result.mutations.push(SessionMutation::AddNextAction {
                action: action.clone(),
            });
        }
        debug!(
            verb = definition.name,
            category = %definition.category,
            mutations = result.mutations.len(),
            "orchestration verb executed"
        );
        Ok(result)
    }

    /// Validate, then execute every verb of `dsl` in order. A verb that fails
    /// is reported and skipped; the ones that succeed are committed to the
    /// session as they complete.
    pub fn process_document(
        &self,
        dsl: &str,
        session: &mut OrchestrationSession,
        registry: &DomainRegistry,
        now: DateTime<Utc>,
    ) -> OrchestrationResult<OrchestrationProcessingResult> {
        self.vocabulary.validate_document(dsl)?;
        let forms = VerbForm::parse_all(dsl)?;

        let mut processing = OrchestrationProcessingResult {
            session_id: session.session_id.clone(),
            ..Default::default()
        };

        for form in &forms {
            let outcome = {
                let ctx = self.context(session, registry, now);
                self.execute(form, &ctx)
            };
            match outcome {
                Ok(result) => {
                    session.apply_mutations(&result.mutations, now)?;
                    session.accumulate_dsl(ORCHESTRATION_DOMAIN, &result.generated_dsl, now)?;
                    processing.merge(result);
                }
                Err(err) => {
                    warn!(
                        session_id = %session.session_id,
                        verb = %form.verb,
                        line = form.line,
                        error = %err,
                        "orchestration verb failed"
                    );
                    processing
                        .errors
                        .push(format!("failed to execute {}: {}", form.verb, err));
                }
            }
        }

        processing.success = processing.errors.is_empty();
        Ok(processing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisInput, ContextAnalyzer};
    use crate::domains::register_standard_domains;
    use crate::planner::ExecutionPlanner;
    use crate::session::SharedContext;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fixture() -> (OrchestrationSession, DomainRegistry) {
        let products = vec!["CUSTODY".to_string(), "TRADING".to_string()];
        let analysis = ContextAnalyzer::new()
            .analyze(&AnalysisInput {
                entity_type: "CORPORATE",
                jurisdiction: "US",
                products: &products,
                ..Default::default()
            })
            .unwrap();
        let plan = ExecutionPlanner::default().plan_at(&analysis, now()).unwrap();
        let shared = SharedContext {
            entity_type: "CORPORATE".to_string(),
            entity_name: "Acme Holdings".to_string(),
            jurisdiction: "US".to_string(),
            products,
            ..Default::default()
        };
        let session = OrchestrationSession::new(
            "s-1",
            shared,
            analysis,
            plan,
            "",
            Duration::from_secs(3600),
            now(),
        );
        let registry = DomainRegistry::new();
        register_standard_domains(&registry).unwrap();
        (session, registry)
    }

    #[test]
    fn test_missing_parameters_are_named() {
        let (session, registry) = fixture();
        let executor = VerbExecutor::default();
        let ctx = executor.context(&session, &registry, now());
        let form = VerbForm::parse_all(r#"(orchestration.initialize (session.id "s-1") (products))"#)
            .unwrap()
            .remove(0);

        let err = executor.execute(&form, &ctx).unwrap_err();
        assert_eq!(
            err,
            VerbError::MissingParameters {
                verb: "orchestration.initialize".to_string(),
                missing: "cbu.id, entity.name, entity.type, jurisdiction, products".to_string(),
            }
        );
    }

    #[test]
    fn test_document_applies_each_verb_atomically() {
        let (mut session, registry) = fixture();
        let executor = VerbExecutor::default();
        let dsl = r#"
(state.initialize.shared
  (session.id "s-1")
  (primary.entity @attr{entity.primary.id})
  (shared.attributes @attr{entity.legal_name})
  (accessible.domains "kyc" "custody"))
(workflow.execute.subdomain (domain "nowhere") (entity.target @attr{entity.primary.id}))
(workflow.execute.subdomain
  (domain "kyc")
  (template "enhanced-kyc-workflow")
  (entity.target @attr{entity.primary.id})
  (result.binding @attr{kyc.completion.status}))
"#;

        let result = executor
            .process_document(dsl, &mut session, &registry, now())
            .unwrap();

        assert!(!result.success);
        assert_eq!(
            result.processed_verbs,
            vec!["state.initialize.shared", "workflow.execute.subdomain"]
        );
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("domain nowhere is not registered"));
        assert_eq!(result.next_actions, vec!["await_completion_kyc"]);
        assert_eq!(result.domain_updates["kyc"], vec!["Execute template: enhanced-kyc-workflow"]);

        assert_eq!(session.version_number(), 2);
        assert!(session.unified_dsl().contains("(state.shared.active"));
        assert!(session.unified_dsl().contains("(status \"INITIATED\")"));
        assert_eq!(
            session.attributes.domains_for("entity.legal_name"),
            vec!["custody", "kyc"]
        );
        assert_eq!(session.next_actions, vec!["await_completion_kyc"]);
        assert_eq!(session.entity_refs["primary_entity"], "entity.primary.id");
    }

    #[test]
    fn test_unknown_verb_rejects_whole_document() {
        let (mut session, registry) = fixture();
        let executor = VerbExecutor::default();
        let err = executor
            .process_document(
                "(state.sync.attributes (attributes @attr{a}) (between.domains \"kyc\"))\n(orchestration.coordinate)",
                &mut session,
                &registry,
                now(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("unknown orchestration verb 'orchestration.coordinate'"));
        assert_eq!(session.version_number(), 0);
    }
}
