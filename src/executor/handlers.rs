//! Category handlers for orchestration verbs
//!
//! Each handler reads the verb's parameters and the execution context and
//! returns the fragment to accumulate plus the session mutations to apply.
//! Required parameters have already been checked by the executor.

use std::collections::{BTreeMap, BTreeSet};

use chrono::SecondsFormat;
use dsl_types::{ComplianceTier, DomainSessionState, EntityType};
use serde_json::{json, Value};

use super::{ExecutionContext, VerbExecutionResult};
use crate::analysis::{product_domain, AnalysisInput, ContextAnalyzer};
use crate::attributes::ConflictStrategy;
use crate::dsl::{quote, DslForm, VerbForm};
use crate::error::{AnalysisError, VerbError};
use crate::session::SessionMutation;
use crate::vocabulary::*;

type HandlerResult = Result<VerbExecutionResult, VerbError>;

// ============================================================================
// SHARED HELPERS
// ============================================================================

fn timestamp(ctx: &ExecutionContext<'_>) -> String {
    ctx.now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn fragment(comment: &str, form: DslForm) -> String {
    format!("; {}\n{}", comment, form.render())
}

/// Value of a parameter the executor has already verified
fn param(form: &VerbForm, key: &str) -> String {
    form.text(key).unwrap_or_default()
}

fn invalid(verb: &str, parameter: &str, reason: impl Into<String>) -> VerbError {
    VerbError::InvalidParameter {
        verb: verb.to_string(),
        parameter: parameter.to_string(),
        reason: reason.into(),
    }
}

fn unknown_verb(form: &VerbForm) -> VerbError {
    VerbError::UnknownVerb {
        verb: form.verb.clone(),
        line: form.line,
    }
}

fn require_registered(ctx: &ExecutionContext<'_>, domain: &str) -> Result<(), VerbError> {
    if ctx.registry.contains(domain) {
        Ok(())
    } else {
        Err(VerbError::DomainNotRegistered {
            domain: domain.to_string(),
        })
    }
}

fn require_target(ctx: &ExecutionContext<'_>, domain: &str) -> Result<(), VerbError> {
    if ctx.registry.contains(domain) {
        Ok(())
    } else {
        Err(VerbError::TargetDomainNotFound {
            domain: domain.to_string(),
        })
    }
}

fn require_session_id(verb: &str, form: &VerbForm, ctx: &ExecutionContext<'_>) -> Result<String, VerbError> {
    let session_id = param(form, "session.id");
    if session_id != ctx.session.session_id {
        return Err(invalid(
            verb,
            "session.id",
            format!("'{}' is not the executing session", session_id),
        ));
    }
    Ok(session_id)
}

/// Warnings for domains that are not part of the session's plan
fn unplanned(ctx: &ExecutionContext<'_>, domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .filter(|d| !ctx.session.execution_plan.contains(d))
        .map(|d| format!("domain {} is not part of this session's execution plan", d))
        .collect()
}

fn register_attributes(result: &mut VerbExecutionResult, attributes: &[String], domains: &[String]) {
    for attribute_id in attributes {
        result.mutate(SessionMutation::RegisterAttribute {
            attribute_id: attribute_id.clone(),
            domains: domains.to_vec(),
        });
    }
}

fn analysis_error(verb: &str, err: AnalysisError) -> VerbError {
    let parameter = match &err {
        AnalysisError::UnsupportedEntityType { .. } => "entity.type",
        AnalysisError::UnsupportedJurisdiction { .. } => "jurisdiction",
        AnalysisError::UnsupportedProduct { .. } => "products",
    };
    invalid(verb, parameter, err.to_string())
}

// ============================================================================
// CONTEXT VERBS
// ============================================================================

pub fn context(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    match verb {
        INITIALIZE => initialize(form, verb, ctx),
        CONTEXT_ANALYZE => analyze(form, verb, ctx),
        DOMAINS_DETERMINE => determine_domains(form, verb, ctx),
        EXECUTION_PLAN => plan_execution(form, verb, ctx),
        _ => Err(unknown_verb(form)),
    }
}

fn initialize(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let session_id = require_session_id(verb, form, ctx)?;
    let cbu_id = param(form, "cbu.id");
    let entity_name = param(form, "entity.name");
    let raw_type = param(form, "entity.type");
    let entity_type = EntityType::from_code(&raw_type)
        .ok_or_else(|| invalid(verb, "entity.type", format!("unsupported entity type '{}'", raw_type)))?;
    let jurisdiction = param(form, "jurisdiction").to_uppercase();
    let products = form.texts("products");

    let dsl = fragment(
        "Orchestration session initialized",
        DslForm::new("orchestration.session.active")
            .text("session.id", &session_id)
            .text("cbu.id", &cbu_id)
            .text("entity.name", &entity_name)
            .text("entity.type", entity_type.as_str())
            .text("jurisdiction", &jurisdiction)
            .texts("products", &products)
            .text("initialized.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    result.data("initialized", true);
    result.data("session_id", session_id);
    result.data("entity_type", entity_type.as_str());
    if products != ctx.session.shared_context.products {
        result.warn("initialised products differ from the products the session was planned for");
    }
    result.mutate(SessionMutation::SetEntityRef {
        name: "cbu".to_string(),
        value: cbu_id.clone(),
    });
    result.mutate(SessionMutation::InitializeContext {
        cbu_id,
        entity_name,
        entity_type: entity_type.as_str().to_string(),
        jurisdiction,
        products,
    });
    Ok(result)
}

fn analyze(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let entity_type = param(form, "entity.type");
    let jurisdiction = param(form, "jurisdiction");
    let products = form.texts("products");
    let shared = &ctx.session.shared_context;

    let analysis = ContextAnalyzer::new()
        .analyze(&AnalysisInput {
            entity_type: &entity_type,
            jurisdiction: &jurisdiction,
            products: &products,
            workflow_type: shared.workflow_type,
            risk_profile: shared.risk_profile.as_deref(),
            requested_tier: Some(shared.compliance_tier),
        })
        .map_err(|e| analysis_error(verb, e))?;

    let dsl = fragment(
        "Context analysis completed",
        DslForm::new("orchestration.context.analyzed")
            .text("entity.type", analysis.entity_type.as_str())
            .texts("products", &products)
            .text("jurisdiction", jurisdiction.to_uppercase())
            .text("complexity.determined", analysis.estimated_complexity.as_str())
            .texts("required.domains", &analysis.required_domains)
            .text("analyzed.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    if let Some(claimed) = form.text("complexity.assessment") {
        if !claimed.eq_ignore_ascii_case(analysis.estimated_complexity.as_str()) {
            result.warn(format!(
                "complexity assessed as {} but analysis determined {}",
                claimed.to_uppercase(),
                analysis.estimated_complexity
            ));
        }
    }
    for warning in unplanned(ctx, &analysis.required_domains) {
        result.warn(warning);
    }
    result.data("context_analyzed", true);
    result.data("primary_domain", analysis.primary_domain.clone());
    result.data("required_domains", json!(analysis.required_domains));
    result.data("complexity", analysis.estimated_complexity.as_str());
    Ok(result)
}

fn determine_domains(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let primary = param(form, "primary.domain");
    let required = form.texts("required.domains");
    let dependencies = form.pairs("dependencies");
    let required_set: BTreeSet<&str> = required.iter().map(String::as_str).collect();

    for (domain, deps) in &dependencies {
        if let Some(outside) = std::iter::once(domain)
            .chain(deps.iter())
            .find(|d| !required_set.contains(d.as_str()))
        {
            return Err(invalid(
                verb,
                "dependencies",
                format!("'{}' is not one of the required domains", outside),
            ));
        }
    }

    let dsl = fragment(
        "Domains determined",
        DslForm::new("orchestration.domains.determined")
            .text("primary.domain", &primary)
            .texts("required.domains", &required)
            .raw("dependency.count", dependencies.len().to_string())
            .text("determined.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    if !required_set.contains(primary.as_str()) {
        result.warn(format!("primary domain {} is not among the required domains", primary));
    }
    if primary != ctx.session.primary_domain {
        result.warn(format!(
            "session was planned with primary domain {}",
            ctx.session.primary_domain
        ));
    }
    for warning in unplanned(ctx, &required) {
        result.warn(warning);
    }
    result.data("domains_determined", true);
    result.mutate(SessionMutation::SetData {
        key: "determined_domains".to_string(),
        value: json!(required),
    });
    Ok(result)
}

fn plan_execution(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let session_id = require_session_id(verb, form, ctx)?;
    let declared = form
        .number("total.stages")
        .filter(|n| n.fract() == 0.0 && *n >= 0.0)
        .ok_or_else(|| invalid(verb, "total.stages", "expected a whole number"))? as usize;
    let defined = form.all("stage").len();
    if declared != defined {
        return Err(invalid(
            verb,
            "total.stages",
            format!("declares {} stages but {} are defined", declared, defined),
        ));
    }

    let dsl = fragment(
        "Execution plan created",
        DslForm::new("orchestration.execution.planned")
            .text("session.id", &session_id)
            .raw("total.stages", declared.to_string())
            .text("plan.created.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    let planned = ctx.session.execution_plan.total_stages();
    if declared != planned {
        result.warn(format!(
            "document declares {} stages; the session plan has {}",
            declared, planned
        ));
    }
    result.data("execution_planned", true);
    result.data("total_stages", declared);
    Ok(result)
}

// ============================================================================
// STATE VERBS
// ============================================================================

pub fn state(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    match verb {
        STATE_INITIALIZE_SHARED => initialize_shared(form, verb, ctx),
        STATE_SHARE_CROSS_DOMAIN => share_cross_domain(form, verb, ctx),
        STATE_SYNC_ATTRIBUTES => sync_attributes(form, verb, ctx),
        STATE_VALIDATE_CONSISTENCY => validate_consistency(form, verb, ctx),
        _ => Err(unknown_verb(form)),
    }
}

fn initialize_shared(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let session_id = require_session_id(verb, form, ctx)?;
    let primary_entity = param(form, "primary.entity");
    let shared = form.texts("shared.attributes");
    let domains = form.texts("accessible.domains");

    let dsl = fragment(
        "Shared state initialized",
        DslForm::new("state.shared.active")
            .text("session.id", &session_id)
            .text("primary.entity", &primary_entity)
            .texts("shared.attributes", &shared)
            .texts("accessible.domains", &domains),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    register_attributes(&mut result, &shared, &domains);
    result.mutate(SessionMutation::SetEntityRef {
        name: "primary_entity".to_string(),
        value: primary_entity,
    });
    for warning in unplanned(ctx, &domains) {
        result.warn(warning);
    }
    result.data("shared_state_initialized", true);
    result.attribute_refs = shared;
    Ok(result)
}

fn share_cross_domain(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let from = param(form, "from.domain");
    let to = form.texts("to.domains");
    let attributes = form.texts("attributes");
    let access_mode = form.text("access.mode").unwrap_or_else(|| "READ".to_string());

    let dsl = fragment(
        "Cross-domain state sharing",
        DslForm::new("state.cross.domain.shared")
            .text("from.domain", &from)
            .texts("to.domains", &to)
            .texts("attributes", &attributes)
            .text("access.mode", access_mode.to_uppercase())
            .optional_text("sync.strategy", form.text("sync.strategy").as_deref())
            .text("shared.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    let participants: Vec<String> = std::iter::once(from).chain(to).collect();
    register_attributes(&mut result, &attributes, &participants);
    for warning in unplanned(ctx, &participants) {
        result.warn(warning);
    }
    result.attribute_refs = attributes;
    Ok(result)
}

fn sync_attributes(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let attributes = form.texts("attributes");
    let between = form.texts("between.domains");
    let requested = form.text("conflict.resolution");
    let strategy = requested
        .as_deref()
        .map(ConflictStrategy::parse_or_default)
        .unwrap_or_default();

    let dsl = fragment(
        "Attributes synchronized",
        DslForm::new("state.attributes.synchronized")
            .texts("attributes", &attributes)
            .texts("between.domains", &between)
            .text("conflict.resolution", strategy.as_str())
            .text("synchronized.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    if let Some(name) = requested.filter(|n| !n.eq_ignore_ascii_case(strategy.as_str())) {
        result.warn(format!(
            "unknown conflict resolution '{}', using {}",
            name, strategy
        ));
    }
    register_attributes(&mut result, &attributes, &between);
    for attribute_id in &attributes {
        result.mutate(SessionMutation::SetData {
            key: format!("sync_strategy.{}", attribute_id),
            value: json!(strategy.as_str()),
        });
    }
    if form.flag("validation.required").unwrap_or(false) {
        for attribute_id in &attributes {
            let report = ctx.session.attributes.validate_consistency(attribute_id);
            if !report.consistent {
                result.warn(format!(
                    "attribute {} currently differs across domains",
                    attribute_id
                ));
            }
        }
    }
    for warning in unplanned(ctx, &between) {
        result.warn(warning);
    }
    result.attribute_refs = attributes;
    Ok(result)
}

fn validate_consistency(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let scope = form.texts("scope.domains");
    let critical = form.texts("critical.attributes");
    let fail_on_inconsistency = form.flag("fail.on.inconsistency").unwrap_or(false);

    let mut inconsistent = Vec::new();
    let mut details = Vec::new();
    for attribute_id in &critical {
        let report = ctx.session.attributes.validate_consistency(attribute_id);
        let in_scope: BTreeMap<&String, &String> = report
            .observed
            .iter()
            .filter(|(domain, _)| scope.contains(domain))
            .collect();
        let distinct: BTreeSet<&String> = in_scope.values().copied().collect();
        if distinct.len() > 1 {
            let observed: Vec<String> = in_scope
                .iter()
                .map(|(domain, value)| format!("{}={}", domain, value))
                .collect();
            details.push(format!(
                "attribute {} differs across domains: {}",
                attribute_id,
                observed.join(", ")
            ));
            inconsistent.push(attribute_id.clone());
        }
    }

    if fail_on_inconsistency && !inconsistent.is_empty() {
        return Err(VerbError::ConsistencyViolation {
            verb: verb.to_string(),
            attributes: inconsistent.join(", "),
        });
    }

    let consistent = inconsistent.is_empty();
    let dsl = fragment(
        "Consistency validated",
        DslForm::new("state.consistency.validated")
            .texts("scope.domains", &scope)
            .texts("critical.attributes", &critical)
            .flag("consistent", consistent)
            .text("validated.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    for detail in details {
        result.warn(detail);
    }
    result.data("consistent", consistent);
    result.data("inconsistent_attributes", json!(inconsistent));
    result.attribute_refs = critical;
    Ok(result)
}

// ============================================================================
// WORKFLOW VERBS
// ============================================================================

pub fn workflow(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    match verb {
        WORKFLOW_EXECUTE_SUBDOMAIN => execute_subdomain(form, verb, ctx),
        WORKFLOW_COORDINATE_PARALLEL => coordinate_parallel(form, verb, ctx),
        WORKFLOW_WAIT_FOR_COMPLETION => wait_for_completion(form, verb, ctx),
        WORKFLOW_APPLY_PRODUCT_REQUIREMENTS => apply_product_requirements(form, verb, ctx),
        _ => Err(unknown_verb(form)),
    }
}

fn await_action(domain: &str) -> String {
    format!("await_completion_{}", domain)
}

fn execute_subdomain(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let domain = param(form, "domain");
    require_registered(ctx, &domain)?;
    let template = form
        .text("template")
        .unwrap_or_else(|| format!("{}-workflow", domain));
    let entity_target = param(form, "entity.target");
    let binding = form.text("result.binding");
    let depends_on = form.texts("depends.on");

    let mut dsl_form = DslForm::new("workflow.subdomain.execute")
        .text("domain", &domain)
        .text("template", &template)
        .text("entity.target", &entity_target)
        .optional_text("result.binding", binding.as_deref());
    if !depends_on.is_empty() {
        dsl_form = dsl_form.texts("depends.on", &depends_on);
    }
    let dsl = fragment(
        "Subdomain workflow execution",
        dsl_form
            .text("status", "INITIATED")
            .text("timestamp", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    result
        .domain_updates
        .insert(domain.clone(), format!("Execute template: {}", template));
    result.next_actions.push(await_action(&domain));
    result.attribute_refs.push(entity_target.clone());
    result.data("domain", domain.clone());
    result.data("template", template.clone());

    if let Some(current) = ctx.session.active_domains.get(&domain) {
        // Finished domains keep their state
        if current.state.is_finished() {
            result.warn(format!(
                "domain {} is already {}, state left unchanged",
                domain, current.state
            ));
        } else {
            result.mutate(SessionMutation::SetDomainState {
                domain: domain.clone(),
                state: DomainSessionState::Running,
            });
        }
        result.mutate(SessionMutation::SetDomainContext {
            domain: domain.clone(),
            key: "template".to_string(),
            value: json!(template),
        });
        result.mutate(SessionMutation::SetDomainContext {
            domain: domain.clone(),
            key: "entity_target".to_string(),
            value: json!(entity_target),
        });
        for (key, values) in form.pairs("context.data") {
            let value = match values.as_slice() {
                [single] => json!(single),
                many => json!(many),
            };
            result.mutate(SessionMutation::SetDomainContext {
                domain: domain.clone(),
                key,
                value,
            });
        }
    } else {
        result.extend_warnings(unplanned(ctx, std::slice::from_ref(&domain)));
    }

    if let Some(binding) = binding {
        result.mutate(SessionMutation::SetAttributeRef {
            name: format!("{}.result", domain),
            attribute_id: binding.clone(),
        });
        result.attribute_refs.push(binding);
    }
    Ok(result)
}

fn coordinate_parallel(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let workflows = form.texts("workflows");
    for domain in &workflows {
        require_registered(ctx, domain)?;
    }
    let sync_points = form.texts("sync.points");
    let failure_strategy = form
        .text("failure.strategy")
        .unwrap_or_else(|| "FAIL_FAST".to_string());

    let plan = &ctx.session.execution_plan;
    let stages: BTreeSet<usize> = workflows.iter().filter_map(|d| plan.stage_of(d)).collect();
    if stages.len() > 1 {
        let names: Vec<String> = stages.iter().map(|n| format!("stage_{}", n)).collect();
        return Err(invalid(
            verb,
            "workflows",
            format!(
                "domains span {}; only domains of one stage may run in parallel",
                names.join(", ")
            ),
        ));
    }

    let dsl = fragment(
        "Parallel workflows coordinated",
        DslForm::new("workflow.parallel.coordinated")
            .texts("workflows", &workflows)
            .texts("sync.points", &sync_points)
            .text("failure.strategy", failure_strategy.to_uppercase())
            .text("coordinated.at", timestamp(ctx))
            .text("status", "INITIATED"),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    if let Some(stage) = stages
        .first()
        .and_then(|n| plan.stages.iter().find(|s| s.number == *n))
    {
        if !stage.parallel && workflows.len() > 1 {
            result.warn(format!(
                "{} is not marked parallel; workflows will run one after another",
                stage.name
            ));
        }
    }
    if let Some(timeout) = form.number("timeout") {
        let limit = ctx.max_duration.as_secs_f64();
        if timeout > limit {
            result.warn(format!(
                "timeout of {}s exceeds the {}s execution ceiling",
                timeout, limit
            ));
        }
    }
    result.extend_warnings(unplanned(ctx, &workflows));
    result.next_actions = workflows.iter().map(|d| await_action(d)).collect();
    result.data("workflows", json!(workflows));
    Ok(result)
}

fn wait_for_completion(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let workflows = form.texts("workflows");
    for domain in &workflows {
        require_registered(ctx, domain)?;
    }
    let (completed, pending): (Vec<String>, Vec<String>) =
        workflows.iter().cloned().partition(|d| {
            ctx.session
                .domain(d)
                .is_some_and(|s| s.state == DomainSessionState::Completed)
        });
    let status = if pending.is_empty() { "COMPLETE" } else { "WAITING" };

    let mut dsl_form = DslForm::new("workflow.completion.awaited").texts("workflows", &workflows);
    if !pending.is_empty() {
        dsl_form = dsl_form.texts("pending", &pending);
    }
    let dsl = fragment(
        "Workflow completion awaited",
        dsl_form
            .text("awaited.at", timestamp(ctx))
            .text("status", status),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    if !pending.is_empty() && form.flag("partial.completion").unwrap_or(false) {
        result.warn(format!(
            "accepting partial completion; still pending: {}",
            pending.join(", ")
        ));
    }
    result.extend_warnings(unplanned(ctx, &workflows));
    result.next_actions = pending.iter().map(|d| await_action(d)).collect();
    result.attribute_refs = form.texts("required.attributes");
    result.data("completed", json!(completed));
    result.data("pending", json!(pending));
    Ok(result)
}

fn apply_product_requirements(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let products = form.texts("products");
    let entities = form.texts("to.entities");

    let mut by_domain: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for product in &products {
        let domain = product_domain(product).map_err(|e| analysis_error(verb, e))?;
        require_registered(ctx, domain)?;
        by_domain.entry(domain).or_default().push(product.to_uppercase());
    }

    let dsl = fragment(
        "Product requirements applied",
        DslForm::new("workflow.product.requirements.applied")
            .texts("products", &products)
            .texts("to.entities", &entities)
            .text("applied.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    for (domain, domain_products) in by_domain {
        result.domain_updates.insert(
            domain.to_string(),
            format!("Apply product requirements: {}", domain_products.join(", ")),
        );
        if ctx.session.active_domains.contains_key(domain) {
            result.mutate(SessionMutation::SetDomainContext {
                domain: domain.to_string(),
                key: "product_requirements".to_string(),
                value: json!(domain_products),
            });
        } else {
            result.warn(format!(
                "product domain {} is not part of this session's execution plan",
                domain
            ));
        }
    }
    result.attribute_refs = entities;
    Ok(result)
}

// ============================================================================
// COMMUNICATION VERBS
// ============================================================================

pub fn communication(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    match verb {
        DOMAIN_ROUTE_TO => route_to(form, verb, ctx),
        DOMAIN_COLLECT_RESULTS => collect_results(form, verb, ctx),
        DOMAIN_BROADCAST_STATE => broadcast_state(form, verb, ctx),
        _ => Err(unknown_verb(form)),
    }
}

fn route_to(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let domain = param(form, "domain");
    require_target(ctx, &domain)?;
    let payload = param(form, "dsl.fragment");
    let priority = form
        .text("priority")
        .map(|p| p.to_uppercase())
        .unwrap_or_else(|| "NORMAL".to_string());

    let dsl = fragment(
        "DSL routing to domain",
        DslForm::new("domain.message.route")
            .text("target.domain", &domain)
            .text("priority", &priority)
            .optional_text("correlation.id", form.text("correlation.id").as_deref())
            .optional_text("context", form.text("context").as_deref())
            .raw("payload", quote(&payload))
            .text("routed.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    result.domain_updates.insert(domain.clone(), payload);
    result.extend_warnings(unplanned(ctx, std::slice::from_ref(&domain)));
    result.data("routed_to", domain);
    result.data("priority", priority);
    Ok(result)
}

fn collect_results(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let from = form.texts("from.domains");
    for domain in &from {
        require_target(ctx, domain)?;
    }
    let binding = param(form, "result.binding");
    let strategy = form
        .text("aggregation.strategy")
        .map(|s| s.to_uppercase())
        .unwrap_or_else(|| "MERGE".to_string());

    let dsl = fragment(
        "Domain results collected",
        DslForm::new("domain.results.collected")
            .texts("from.domains", &from)
            .text("result.binding", &binding)
            .text("aggregation.strategy", &strategy)
            .text("collected.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    register_attributes(&mut result, std::slice::from_ref(&binding), &from);
    result.mutate(SessionMutation::SetAttributeRef {
        name: "collected_results".to_string(),
        attribute_id: binding.clone(),
    });
    result.extend_warnings(unplanned(ctx, &from));
    result.attribute_refs = vec![binding];
    Ok(result)
}

fn broadcast_state(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let attributes = form.texts("attributes");
    let to = form.texts("to.domains");
    for domain in &to {
        require_target(ctx, domain)?;
    }
    let change_type = form
        .text("change.type")
        .map(|c| c.to_uppercase())
        .unwrap_or_else(|| "UPDATE".to_string());
    let immediate = form.flag("immediate").unwrap_or(true);

    let dsl = fragment(
        "State broadcasted to domains",
        DslForm::new("domain.state.broadcasted")
            .texts("attributes", &attributes)
            .texts("to.domains", &to)
            .text("change.type", &change_type)
            .flag("immediate", immediate)
            .text("broadcasted.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    register_attributes(&mut result, &attributes, &to);
    for domain in &to {
        result.domain_updates.insert(
            domain.clone(),
            format!("State change ({}): {}", change_type, attributes.join(", ")),
        );
    }
    result.extend_warnings(unplanned(ctx, &to));
    result.attribute_refs = attributes;
    Ok(result)
}

// ============================================================================
// PRODUCT VERBS
// ============================================================================

pub fn product(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    match verb {
        PRODUCTS_VALIDATE_COMPATIBILITY => validate_compatibility(form, verb, ctx),
        PRODUCTS_CONFIGURE_CROSS_DOMAIN => configure_cross_domain(form, verb, ctx),
        _ => Err(unknown_verb(form)),
    }
}

fn validate_compatibility(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let entities = form.texts("entities");
    let products = form.texts("products");
    let shared = &ctx.session.shared_context;
    let jurisdictions = match form.texts("jurisdictions") {
        given if !given.is_empty() => given,
        _ if !shared.jurisdiction.is_empty() => vec![shared.jurisdiction.clone()],
        _ => Vec::new(),
    };
    let tier = form
        .text("compliance.tier")
        .map(|t| {
            t.parse::<ComplianceTier>()
                .map_err(|reason| invalid(verb, "compliance.tier", reason))
        })
        .transpose()?;

    let entity_type = EntityType::from_code(&shared.entity_type);
    let report = ctx
        .compatibility
        .evaluate(&products, entity_type, &jurisdictions);

    let dsl = fragment(
        "Product compatibility validation",
        DslForm::new("products.compatibility.validated")
            .texts("entities", &entities)
            .texts("products", &products)
            .texts("jurisdictions", &jurisdictions)
            .flag("all.compatible", report.all_compatible)
            .text("validated.at", timestamp(ctx)),
    );

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    result.success = report.all_compatible;
    for verdict in &report.products {
        result
            .errors
            .extend(verdict.issues.iter().map(|i| format!("{}: {}", verdict.product, i)));
        result.warnings.extend(verdict.warnings.iter().cloned());
    }
    if let Some(tier) = tier {
        if tier < shared.compliance_tier {
            result.warn(format!(
                "requested tier {} is below the session's {} tier",
                tier, shared.compliance_tier
            ));
        }
    }

    let verdicts: serde_json::Map<String, Value> = report
        .products
        .iter()
        .map(|p| (p.product.clone(), Value::Bool(p.compatible)))
        .collect();
    result.data("compatibility_results", Value::Object(verdicts.clone()));
    result.data("all_compatible", report.all_compatible);
    result.data("rules", ctx.compatibility.name());
    result.mutate(SessionMutation::SetData {
        key: "product_compatibility".to_string(),
        value: Value::Object(verdicts),
    });
    result.attribute_refs = entities;
    Ok(result)
}

fn configure_cross_domain(form: &VerbForm, verb: &str, ctx: &ExecutionContext<'_>) -> HandlerResult {
    let products = form.texts("products");
    let affected = form.texts("affected.domains");
    for domain in &affected {
        require_registered(ctx, domain)?;
    }
    let configuration = form.pairs("configuration");
    if configuration.is_empty() {
        return Err(invalid(verb, "configuration", "expected (key value ...) entries"));
    }

    let rendered: Vec<String> = configuration
        .iter()
        .map(|(key, values)| {
            let values: Vec<String> = values.iter().map(|v| quote(v)).collect();
            format!("({} {})", key, values.join(" "))
        })
        .collect();
    let dsl = fragment(
        "Products configured across domains",
        DslForm::new("products.cross.domain.configured")
            .texts("products", &products)
            .raws("configuration", rendered)
            .texts("affected.domains", &affected)
            .text("configured.at", timestamp(ctx)),
    );

    let settings: serde_json::Map<String, Value> = configuration
        .into_iter()
        .map(|(key, values)| {
            let value = match values.as_slice() {
                [single] => json!(single),
                many => json!(many),
            };
            (key, value)
        })
        .collect();

    let mut result = VerbExecutionResult::new(verb).with_dsl(dsl);
    for domain in &affected {
        result.domain_updates.insert(
            domain.clone(),
            format!("Configure products: {}", products.join(", ")),
        );
        if ctx.session.active_domains.contains_key(domain) {
            result.mutate(SessionMutation::SetDomainContext {
                domain: domain.clone(),
                key: "product_configuration".to_string(),
                value: Value::Object(settings.clone()),
            });
        }
    }
    result.extend_warnings(unplanned(ctx, &affected));
    result.data("configured", true);
    Ok(result)
}

impl VerbExecutionResult {
    fn extend_warnings(&mut self, warnings: Vec<String>) {
        self.warnings.extend(warnings);
    }
}
