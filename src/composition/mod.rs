//! DSL Composition Engine
//!
//! Renders one fragment per logical component of a case (entity workflow,
//! each requested product, each applicable compliance ruleset, and the
//! stage coordination block) and merges them into a single master document.
//!
//! ## Merge order
//! Header comments and `orchestration.session.initialize` first, then the
//! components that belong to no domain (coordination, entity), then every
//! domain-owned component in the stage order of its owning domain.
//!
//! ## Determinism
//! Rendering is a pure function of the request and the plan. The only
//! timestamp in the output is the caller-supplied `requested_at`.

pub mod templates;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dsl_types::{ComplianceTier, ComponentValidation, ContextAnalysis, EntityType, ExecutionPlan};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::analysis::{product_domain, AnalysisInput, ContextAnalyzer, JurisdictionClass, KYC};
use crate::config::OrchestratorConfig;
use crate::dsl::{check_balance, quote, DslForm};
use crate::error::CompositionError;
use crate::planner::ExecutionPlanner;

pub use templates::{DslTemplate, TemplateContext, TEMPLATE_IDS};

/// Composition behaviour
#[derive(Debug, Clone)]
pub struct CompositionConfig {
    pub base_stage_duration: Duration,
    pub include_header_comments: bool,
    pub enable_parallel_execution: bool,
    pub max_domain_depth: usize,
}

impl Default for CompositionConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for CompositionConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            base_stage_duration: config.base_stage_duration,
            include_header_comments: true,
            enable_parallel_execution: config.enable_parallel_execution,
            max_domain_depth: config.max_domain_depth,
        }
    }
}

/// Everything needed to compose a master document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionRequest {
    pub session_id: String,
    pub cbu_id: String,
    pub entity_name: String,
    pub entity_type: String,
    pub jurisdiction: String,
    pub products: Vec<String>,
    #[serde(default)]
    pub workflow_type: dsl_types::WorkflowType,
    #[serde(default)]
    pub risk_profile: Option<String>,
    #[serde(default)]
    pub compliance_tier: Option<ComplianceTier>,
    pub requested_at: DateTime<Utc>,
    /// Extra `domain -> [dependency]` edges merged into the analysed graph
    #[serde(default)]
    pub dependency_overrides: BTreeMap<String, Vec<String>>,
}

impl CompositionRequest {
    pub fn new(
        session_id: impl Into<String>,
        entity_name: impl Into<String>,
        entity_type: impl Into<String>,
        jurisdiction: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            cbu_id: String::new(),
            entity_name: entity_name.into(),
            entity_type: entity_type.into(),
            jurisdiction: jurisdiction.into(),
            products: Vec::new(),
            workflow_type: Default::default(),
            risk_profile: None,
            compliance_tier: None,
            requested_at,
            dependency_overrides: BTreeMap::new(),
        }
    }

    pub fn with_cbu_id(mut self, cbu_id: impl Into<String>) -> Self {
        self.cbu_id = cbu_id.into();
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

    pub fn with_compliance_tier(mut self, tier: ComplianceTier) -> Self {
        self.compliance_tier = Some(tier);
        self
    }

    pub fn with_dependency(mut self, domain: &str, depends_on: &str) -> Self {
        self.dependency_overrides
            .entry(domain.to_string())
            .or_default()
            .push(depends_on.to_string());
        self
    }

    fn analysis_input(&self) -> AnalysisInput<'_> {
        AnalysisInput {
            entity_type: &self.entity_type,
            jurisdiction: &self.jurisdiction,
            products: &self.products,
            workflow_type: self.workflow_type,
            risk_profile: self.risk_profile.as_deref(),
            requested_tier: self.compliance_tier,
        }
    }
}

/// Composed master document and its parts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositionResult {
    pub master_dsl: String,
    pub component_dsls: BTreeMap<String, String>,
    pub execution_plan: ExecutionPlan,
    pub dependency_graph: BTreeMap<String, Vec<String>>,
    /// In emission order
    pub templates_used: Vec<String>,
    pub validation_results: Vec<ComponentValidation>,
    pub warnings: Vec<String>,
    pub composed_at: DateTime<Utc>,
}

impl CompositionResult {
    pub fn is_valid(&self) -> bool {
        self.validation_results.iter().all(|v| v.is_valid)
    }
}

#[derive(Debug, Clone)]
struct Component {
    name: String,
    /// None for coordination and entity components
    owner: Option<String>,
    template: Option<String>,
    dsl: String,
}

pub struct CompositionEngine {
    analyzer: ContextAnalyzer,
    planner: ExecutionPlanner,
    config: CompositionConfig,
}

impl Default for CompositionEngine {
    fn default() -> Self {
        Self::new(CompositionConfig::default())
    }
}

impl CompositionEngine {
    pub fn new(config: CompositionConfig) -> Self {
        let planner = ExecutionPlanner::from_config(
            &OrchestratorConfig::default()
                .with_base_stage_duration(config.base_stage_duration)
                .with_parallel_execution(config.enable_parallel_execution)
                .with_max_domain_depth(config.max_domain_depth),
        );
        Self {
            analyzer: ContextAnalyzer::new(),
            planner,
            config,
        }
    }

    /// Analyse, plan and compose in one step
    pub fn compose(&self, request: &CompositionRequest) -> Result<CompositionResult, CompositionError> {
        let mut analysis = self.analyzer.analyze(&request.analysis_input())?;
        for (domain, extra) in &request.dependency_overrides {
            let deps = analysis.dependencies.entry(domain.clone()).or_default();
            for dep in extra {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            deps.sort();
        }
        let plan = self
            .planner
            .plan_graph(&analysis.required_domains, &analysis.dependencies, request.requested_at)?;
        self.compose_planned(request, &analysis, &plan)
    }

    /// Compose against an analysis and plan computed elsewhere
    pub fn compose_planned(
        &self,
        request: &CompositionRequest,
        analysis: &ContextAnalysis,
        plan: &ExecutionPlan,
    ) -> Result<CompositionResult, CompositionError> {
        let context = TemplateContext {
            session_id: request.session_id.clone(),
            cbu_id: request.cbu_id.clone(),
            entity_name: request.entity_name.clone(),
            entity_type: analysis.entity_type.as_str().to_string(),
            jurisdiction: request.jurisdiction.to_uppercase(),
            products: request.products.clone(),
            compliance_tier: analysis.compliance_tier,
        };

        let mut components = vec![Component {
            name: "coordination".to_string(),
            owner: None,
            template: None,
            dsl: coordination_dsl(&request.session_id, plan),
        }];

        let entity = templates::entity_template(analysis.entity_type, analysis.compliance_tier);
        components.push(render(&context, "entity", None, entity)?);

        for product in &request.products {
            let domain = product_domain(product)?;
            let template = templates::product_template(domain)?;
            components.push(render(
                &context,
                &format!("product_{}", product.to_uppercase()),
                Some(domain),
                template,
            )?);
        }

        for (name, owner, template) in compliance_components(analysis, &request.jurisdiction)? {
            components.push(render(&context, &name, Some(owner), template)?);
        }

        let ordered = order_components(&components, plan);
        let master_dsl = self.merge(request, analysis, &ordered);
        if master_dsl.trim().is_empty() {
            return Err(CompositionError::EmptyOutput);
        }

        let mut validation_results = vec![validate("master", &master_dsl)];
        validation_results.extend(ordered.iter().map(|c| validate(&c.name, &c.dsl)));
        let warnings: Vec<String> = validation_results
            .iter()
            .filter(|v| !v.is_valid)
            .map(|v| format!("component {} failed validation: {}", v.component, v.errors.join("; ")))
            .collect();
        for warning in &warnings {
            warn!(session_id = %request.session_id, "{}", warning);
        }

        debug!(
            session_id = %request.session_id,
            components = ordered.len(),
            stages = plan.total_stages(),
            "master DSL composed"
        );

        Ok(CompositionResult {
            master_dsl,
            templates_used: ordered.iter().filter_map(|c| c.template.clone()).collect(),
            component_dsls: ordered
                .iter()
                .map(|c| (c.name.clone(), c.dsl.clone()))
                .collect(),
            execution_plan: plan.clone(),
            dependency_graph: analysis.dependencies.clone(),
            validation_results,
            warnings,
            composed_at: request.requested_at,
        })
    }

    fn merge(
        &self,
        request: &CompositionRequest,
        analysis: &ContextAnalysis,
        components: &[&Component],
    ) -> String {
        let mut master = String::new();

        if self.config.include_header_comments {
            master.push_str(&format!(
                "; Master DSL for {} ({})\n",
                single_line(&request.entity_name),
                analysis.entity_type
            ));
            master.push_str(&format!(
                "; Generated: {}\n",
                request.requested_at.to_rfc3339_opts(SecondsFormat::Secs, true)
            ));
            master.push_str(&format!("; Jurisdiction: {}\n", single_line(&request.jurisdiction)));
            master.push_str(&format!(
                "; Products: {}\n\n",
                single_line(&request.products.join(", "))
            ));
        }

        let init = DslForm::new("orchestration.session.initialize")
            .text("session.id", &request.session_id)
            .text("cbu.id", &request.cbu_id)
            .text("entity.name", &request.entity_name)
            .text("entity.type", analysis.entity_type.as_str())
            .text("jurisdiction", &request.jurisdiction)
            .texts("products", &request.products)
            .render();
        master.push_str(&init);
        master.push_str("\n\n");

        for component in components {
            master.push_str(&format!("; === {} ===\n", component.name.to_uppercase()));
            master.push_str(&component.dsl);
            master.push_str("\n\n");
        }

        master.truncate(master.trim_end().len());
        master.push('\n');
        master
    }
}

fn render(
    context: &TemplateContext,
    name: &str,
    owner: Option<&str>,
    template: &str,
) -> Result<Component, CompositionError> {
    Ok(Component {
        name: name.to_string(),
        owner: owner.map(str::to_string),
        template: Some(template.to_string()),
        dsl: context.render(template)?,
    })
}

/// (component name, owning domain, template) for jurisdiction and tier rules
fn compliance_components(
    analysis: &ContextAnalysis,
    jurisdiction: &str,
) -> Result<Vec<(String, &'static str, &'static str)>, CompositionError> {
    let class = JurisdictionClass::classify(jurisdiction)?;
    let legal_entity = analysis.entity_type != EntityType::Individual;
    let mut out = Vec::new();

    if let Some(owner) = class.compliance_domain() {
        match class {
            JurisdictionClass::Us if legal_entity => {
                out.push(("compliance_fincen_control_prong".to_string(), owner, templates::FINCEN_CONTROL_PRONG));
                out.push(("compliance_fincen_ownership_prong".to_string(), owner, templates::FINCEN_OWNERSHIP_PRONG));
            }
            JurisdictionClass::Eu(_) => {
                out.push(("compliance_eu_5mld".to_string(), owner, templates::EU_5MLD_DUAL_PRONG));
            }
            JurisdictionClass::Gb if legal_entity => {
                out.push(("compliance_uk_psc".to_string(), owner, templates::UK_PSC_REGISTER));
            }
            JurisdictionClass::Ch => {
                out.push(("compliance_swiss_vsb".to_string(), owner, templates::SWISS_VSB_DILIGENCE));
            }
            _ => {}
        }
    }

    if analysis.compliance_tier == ComplianceTier::Enhanced {
        out.push(("compliance_enhanced_dd".to_string(), KYC, templates::ENHANCED_DUE_DILIGENCE));
    }
    Ok(out)
}

/// `(orchestration.execution.plan ...)` describing every stage
pub fn coordination_dsl(session_id: &str, plan: &ExecutionPlan) -> String {
    let mut form = DslForm::new("orchestration.execution.plan")
        .text("session.id", session_id)
        .raw("total.stages", plan.total_stages().to_string());

    for stage in &plan.stages {
        let mut values = vec![
            stage.number.to_string(),
            format!("(domains {})", quoted(&stage.domains)),
        ];
        if !stage.dependencies.is_empty() {
            values.push(format!("(depends.on {})", quoted(&stage.dependencies)));
        }
        values.push(format!("(parallel.execution {})", stage.parallel));
        form = form.raws("stage", values);
    }
    form.render()
}

/// Domain-free components first, then owners in stage order
fn order_components<'a>(components: &'a [Component], plan: &ExecutionPlan) -> Vec<&'a Component> {
    let mut ordered: Vec<&Component> = components.iter().filter(|c| c.owner.is_none()).collect();
    for domain in plan.domains() {
        ordered.extend(
            components
                .iter()
                .filter(|c| c.owner.as_deref() == Some(domain.as_str())),
        );
    }
    // Owners outside the plan keep their relative order at the end
    ordered.extend(components.iter().filter(|c| {
        c.owner
            .as_deref()
            .is_some_and(|owner| !plan.contains(owner))
    }));
    ordered
}

fn validate(component: &str, dsl: &str) -> ComponentValidation {
    let mut errors = Vec::new();
    if dsl.trim().is_empty() {
        errors.push("component is empty".to_string());
    }
    if let Err(e) = check_balance(dsl) {
        errors.push(e);
    }
    if errors.is_empty() {
        ComponentValidation::valid(component)
    } else {
        ComponentValidation::invalid(component, errors)
    }
}

fn quoted(values: &[String]) -> String {
    values.iter().map(|v| quote(v)).collect::<Vec<_>>().join(" ")
}

fn single_line(text: &str) -> String {
    text.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AnalysisError, PlanError};

    fn at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T09:30:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn corporate_us() -> CompositionRequest {
        CompositionRequest::new("sess-42", "Acme Holdings", "CORPORATE", "US", at())
            .with_cbu_id("CBU-42")
            .with_products(["CUSTODY", "TRADING"])
    }

    #[test]
    fn test_master_dsl_layout() {
        let result = CompositionEngine::default().compose(&corporate_us()).unwrap();
        let master = &result.master_dsl;

        assert!(master.starts_with("; Master DSL for Acme Holdings (CORPORATE)\n"));
        assert!(master.contains("; Generated: 2025-03-01T09:30:00Z\n"));
        assert!(master.contains("(orchestration.session.initialize\n  (session.id \"sess-42\")"));

        let pos = |needle: &str| master.find(needle).unwrap();
        assert!(pos("; === COORDINATION ===") < pos("; === ENTITY ==="));
        assert!(pos("; === ENTITY ===") < pos("; === COMPLIANCE_ENHANCED_DD ==="));
        assert!(pos("; === COMPLIANCE_ENHANCED_DD ===") < pos("; === PRODUCT_CUSTODY ==="));
        assert!(pos("; === PRODUCT_CUSTODY ===") < pos("; === PRODUCT_TRADING ==="));
        assert!(master.contains("; === COMPLIANCE_FINCEN_CONTROL_PRONG ==="));
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_composition_is_byte_identical() {
        let engine = CompositionEngine::default();
        let first = engine.compose(&corporate_us()).unwrap();
        let second = engine.compose(&corporate_us()).unwrap();
        assert_eq!(first.master_dsl, second.master_dsl);
        assert_eq!(first.templates_used, second.templates_used);
    }

    #[test]
    fn test_coordination_fragment() {
        let result = CompositionEngine::default().compose(&corporate_us()).unwrap();
        let coordination = &result.component_dsls["coordination"];
        assert!(coordination.starts_with("(orchestration.execution.plan\n  (session.id \"sess-42\")"));
        assert!(coordination.contains(&format!(
            "(total.stages {})",
            result.execution_plan.total_stages()
        )));
        assert!(coordination.contains("(stage 1 (domains \"onboarding\") (parallel.execution false))"));
        assert!(check_balance(coordination).is_ok());
        crate::dsl::parse_document(coordination).unwrap();
    }

    #[test]
    fn test_templates_follow_jurisdiction_and_entity() {
        let engine = CompositionEngine::default();
        let individual = engine
            .compose(
                &CompositionRequest::new("s", "Jane Doe", "INDIVIDUAL", "US", at())
                    .with_products(["CUSTODY"]),
            )
            .unwrap();
        assert_eq!(individual.templates_used[0], templates::INDIVIDUAL_WORKFLOW);
        assert!(!individual
            .templates_used
            .iter()
            .any(|t| t == templates::FINCEN_CONTROL_PRONG));

        let eu = engine
            .compose(&CompositionRequest::new("s", "Fonds SA", "CORPORATE", "LU", at()))
            .unwrap();
        assert!(eu.templates_used.iter().any(|t| t == templates::EU_5MLD_DUAL_PRONG));

        let swiss = engine
            .compose(
                &CompositionRequest::new("s", "Alpen AG", "CORPORATE", "CH", at())
                    .with_compliance_tier(ComplianceTier::Simplified),
            )
            .unwrap();
        assert_eq!(swiss.templates_used[0], templates::CORPORATE_BASIC_WORKFLOW);
        assert!(swiss.templates_used.iter().any(|t| t == templates::SWISS_VSB_DILIGENCE));
    }

    #[test]
    fn test_invalid_requests_are_errors() {
        let engine = CompositionEngine::default();
        let err = engine
            .compose(&CompositionRequest::new("s", "X", "ROBOT", "US", at()))
            .unwrap_err();
        assert!(matches!(
            err,
            CompositionError::Analysis(AnalysisError::UnsupportedEntityType { .. })
        ));

        let cyclic = corporate_us().with_dependency("onboarding", "trading");
        assert!(matches!(
            engine.compose(&cyclic).unwrap_err(),
            CompositionError::Plan(PlanError::CircularDependency { .. })
        ));
    }

    #[test]
    fn test_unbalanced_component_is_reported_not_fatal() {
        let result = validate("broken", "(kyc.start (entity.name \"x\")");
        assert!(!result.is_valid);
        assert!(result.errors[0].contains("Unmatched parentheses"));
    }
}
