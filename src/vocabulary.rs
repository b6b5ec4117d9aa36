//! Orchestration Vocabulary
//!
//! The closed set of orchestration-level verbs. The vocabulary is an
//! immutable value built once (normally via [`OrchestrationVocabulary::standard`])
//! and handed to the executor and validator by reference.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::dsl::parse_document;
use crate::error::VerbError;

/// Dispatch category of an orchestration verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbCategory {
    Context,
    State,
    Workflow,
    Communication,
    Product,
}

impl VerbCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerbCategory::Context => "context",
            VerbCategory::State => "state",
            VerbCategory::Workflow => "workflow",
            VerbCategory::Communication => "communication",
            VerbCategory::Product => "product",
        }
    }

    pub fn all() -> [VerbCategory; 5] {
        [
            VerbCategory::Context,
            VerbCategory::State,
            VerbCategory::Workflow,
            VerbCategory::Communication,
            VerbCategory::Product,
        ]
    }
}

impl std::fmt::Display for VerbCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    TextList,
    Number,
    Boolean,
    Duration,
    AttributeId,
    AttributeIdList,
    DomainList,
    /// `(key value...)` pairs
    Map,
    /// Nested stage or workflow forms
    Forms,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Text => "string",
            ParamKind::TextList => "stringList",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Duration => "duration",
            ParamKind::AttributeId => "attributeID",
            ParamKind::AttributeIdList => "attributeIDList",
            ParamKind::DomainList => "domainList",
            ParamKind::Map => "map",
            ParamKind::Forms => "forms",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ParamDefinition {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
    pub description: &'static str,
}

/// One orchestration verb
#[derive(Debug, Clone, Serialize)]
pub struct VerbDefinition {
    /// Name used in DSL text
    pub name: &'static str,
    /// Name used in natural-language routing and docs
    pub short_name: &'static str,
    pub category: VerbCategory,
    pub description: &'static str,
    pub parameters: &'static [ParamDefinition],
    pub example: &'static str,
}

impl VerbDefinition {
    pub fn required_parameters(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parameters.iter().filter(|p| p.required).map(|p| p.name)
    }

    pub fn optional_parameters(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parameters.iter().filter(|p| !p.required).map(|p| p.name)
    }
}

const fn required(name: &'static str, kind: ParamKind, description: &'static str) -> ParamDefinition {
    ParamDefinition {
        name,
        kind,
        required: true,
        description,
    }
}

const fn optional(name: &'static str, kind: ParamKind, description: &'static str) -> ParamDefinition {
    ParamDefinition {
        name,
        kind,
        required: false,
        description,
    }
}

use ParamKind::*;

pub const INITIALIZE: &str = "orchestration.initialize";
pub const CONTEXT_ANALYZE: &str = "orchestration.context.analyze";
pub const DOMAINS_DETERMINE: &str = "orchestration.domains.determine";
pub const EXECUTION_PLAN: &str = "orchestration.execution.plan";
pub const STATE_INITIALIZE_SHARED: &str = "state.initialize.shared";
pub const STATE_SHARE_CROSS_DOMAIN: &str = "state.share.cross.domain";
pub const STATE_SYNC_ATTRIBUTES: &str = "state.sync.attributes";
pub const STATE_VALIDATE_CONSISTENCY: &str = "state.validate.consistency";
pub const WORKFLOW_EXECUTE_SUBDOMAIN: &str = "workflow.execute.subdomain";
pub const WORKFLOW_COORDINATE_PARALLEL: &str = "workflow.coordinate.parallel";
pub const WORKFLOW_WAIT_FOR_COMPLETION: &str = "workflow.wait.for.completion";
pub const WORKFLOW_APPLY_PRODUCT_REQUIREMENTS: &str = "workflow.apply.product.requirements";
pub const DOMAIN_ROUTE_TO: &str = "domain.route.to";
pub const DOMAIN_COLLECT_RESULTS: &str = "domain.collect.results";
pub const DOMAIN_BROADCAST_STATE: &str = "domain.broadcast.state";
pub const PRODUCTS_VALIDATE_COMPATIBILITY: &str = "products.validate.compatibility";
pub const PRODUCTS_CONFIGURE_CROSS_DOMAIN: &str = "products.configure.cross.domain";

/// The standard verb table
pub const STANDARD_VERBS: &[VerbDefinition] = &[
    // ------------------------------------------------------------------ context
    VerbDefinition {
        name: INITIALIZE,
        short_name: "initialize",
        category: VerbCategory::Context,
        description: "Initialize an orchestration session for an entity",
        parameters: &[
            required("session.id", Text, "Unique session identifier"),
            required("cbu.id", Text, "CBU identifier"),
            required("entity.name", Text, "Primary entity name"),
            required("entity.type", Text, "Entity type (INDIVIDUAL, CORPORATE, TRUST, PARTNERSHIP)"),
            required("jurisdiction", Text, "Primary jurisdiction"),
            required("products", TextList, "Requested products"),
        ],
        example: r#"(orchestration.initialize (session.id "s-1") (cbu.id "CBU-1") (entity.name "Acme") (entity.type "CORPORATE") (jurisdiction "US") (products "CUSTODY"))"#,
    },
    VerbDefinition {
        name: CONTEXT_ANALYZE,
        short_name: "analyze",
        category: VerbCategory::Context,
        description: "Record the analysed context of the case",
        parameters: &[
            required("entity.type", Text, "Entity type to analyse"),
            required("products", TextList, "Requested products"),
            required("jurisdiction", Text, "Entity jurisdiction"),
            optional("complexity.assessment", Text, "LOW, MEDIUM or HIGH"),
        ],
        example: r#"(orchestration.context.analyze (entity.type "TRUST") (products "CUSTODY") (jurisdiction "GB"))"#,
    },
    VerbDefinition {
        name: DOMAINS_DETERMINE,
        short_name: "determine-domains",
        category: VerbCategory::Context,
        description: "Confirm the primary domain, required domains and their dependencies",
        parameters: &[
            required("primary.domain", Text, "Primary orchestrating domain"),
            required("required.domains", DomainList, "Required domains"),
            required("dependencies", Map, "Domain dependency relationships"),
            optional("parallel.groups", Forms, "Domains that can run in parallel"),
        ],
        example: r#"(orchestration.domains.determine (primary.domain "onboarding") (required.domains "onboarding" "kyc") (dependencies (kyc "onboarding")))"#,
    },
    VerbDefinition {
        name: EXECUTION_PLAN,
        short_name: "plan-execution",
        category: VerbCategory::Context,
        description: "Confirm the staged execution plan",
        parameters: &[
            required("session.id", Text, "Session identifier"),
            required("total.stages", Number, "Number of execution stages"),
            required("stage", Forms, "Stage definitions"),
        ],
        example: r#"(orchestration.execution.plan (session.id "s-1") (total.stages 1) (stage 1 (domains "kyc")))"#,
    },
    // -------------------------------------------------------------------- state
    VerbDefinition {
        name: STATE_INITIALIZE_SHARED,
        short_name: "initialize-shared-state",
        category: VerbCategory::State,
        description: "Declare the shared state visible to a set of domains",
        parameters: &[
            required("session.id", Text, "Orchestration session id"),
            required("primary.entity", AttributeId, "Primary entity attribute"),
            required("shared.attributes", AttributeIdList, "Shared attribute references"),
            required("accessible.domains", DomainList, "Domains with access to shared state"),
        ],
        example: r#"(state.initialize.shared (session.id "s-1") (primary.entity @attr{entity.id}) (shared.attributes @attr{entity.legal_name}) (accessible.domains "kyc" "ubo"))"#,
    },
    VerbDefinition {
        name: STATE_SHARE_CROSS_DOMAIN,
        short_name: "share-cross-domain",
        category: VerbCategory::State,
        description: "Share attributes from one domain to others",
        parameters: &[
            required("from.domain", Text, "Source domain"),
            required("to.domains", DomainList, "Target domains"),
            required("attributes", AttributeIdList, "Attributes to share"),
            optional("access.mode", Text, "READ, WRITE or READ_WRITE"),
            optional("sync.strategy", Text, "Synchronisation strategy"),
        ],
        example: r#"(state.share.cross.domain (from.domain "kyc") (to.domains "ubo") (attributes @attr{entity.legal_name}))"#,
    },
    VerbDefinition {
        name: STATE_SYNC_ATTRIBUTES,
        short_name: "sync-attributes",
        category: VerbCategory::State,
        description: "Declare attribute synchronisation between domains",
        parameters: &[
            required("attributes", AttributeIdList, "Attributes to synchronise"),
            required("between.domains", DomainList, "Domains to synchronise"),
            optional("conflict.resolution", Text, "SOURCE_WINS, TIMESTAMP_WINS or MERGE_VALUES"),
            optional("validation.required", Boolean, "Validate after sync"),
        ],
        example: r#"(state.sync.attributes (attributes @attr{entity.address}) (between.domains "kyc" "custody"))"#,
    },
    VerbDefinition {
        name: STATE_VALIDATE_CONSISTENCY,
        short_name: "validate-consistency",
        category: VerbCategory::State,
        description: "Check that critical attributes agree across domains",
        parameters: &[
            required("scope.domains", DomainList, "Domains to validate"),
            required("critical.attributes", AttributeIdList, "Attributes that must agree"),
            optional("validation.rules", TextList, "Custom validation rules"),
            optional("fail.on.inconsistency", Boolean, "Fail instead of warn"),
        ],
        example: r#"(state.validate.consistency (scope.domains "kyc" "ubo") (critical.attributes @attr{entity.legal_name}))"#,
    },
    // ----------------------------------------------------------------- workflow
    VerbDefinition {
        name: WORKFLOW_EXECUTE_SUBDOMAIN,
        short_name: "execute-subdomain",
        category: VerbCategory::Workflow,
        description: "Start a domain sub-workflow",
        parameters: &[
            required("domain", Text, "Target domain"),
            required("entity.target", AttributeId, "Target entity attribute"),
            optional("template", Text, "Workflow template"),
            optional("depends.on", AttributeIdList, "Prerequisite attributes"),
            optional("result.binding", AttributeId, "Where to bind results"),
            optional("context.data", Map, "Context passed to the domain"),
        ],
        example: r#"(workflow.execute.subdomain (domain "kyc") (entity.target @attr{entity.id}))"#,
    },
    VerbDefinition {
        name: WORKFLOW_COORDINATE_PARALLEL,
        short_name: "coordinate-parallel",
        category: VerbCategory::Workflow,
        description: "Run several domain workflows of one stage concurrently",
        parameters: &[
            required("workflows", DomainList, "Domains to run together"),
            required("sync.points", TextList, "Synchronisation checkpoints"),
            optional("timeout", Duration, "Execution timeout in seconds"),
            optional("failure.strategy", Text, "Strategy on workflow failure"),
        ],
        example: r#"(workflow.coordinate.parallel (workflows "custody" "us-compliance") (sync.points "stage_4.complete"))"#,
    },
    VerbDefinition {
        name: WORKFLOW_WAIT_FOR_COMPLETION,
        short_name: "wait-for-completion",
        category: VerbCategory::Workflow,
        description: "Wait for domain workflows to complete",
        parameters: &[
            required("workflows", DomainList, "Domains to wait for"),
            optional("timeout", Duration, "Maximum wait in seconds"),
            optional("partial.completion", Boolean, "Accept partial completion"),
            optional("required.attributes", AttributeIdList, "Required output attributes"),
        ],
        example: r#"(workflow.wait.for.completion (workflows "kyc" "ubo"))"#,
    },
    VerbDefinition {
        name: WORKFLOW_APPLY_PRODUCT_REQUIREMENTS,
        short_name: "apply-product-requirements",
        category: VerbCategory::Workflow,
        description: "Apply product requirements to entities",
        parameters: &[
            required("products", TextList, "Products to apply"),
            required("to.entities", AttributeIdList, "Target entities"),
            optional("depends.on", AttributeIdList, "Prerequisite completions"),
            optional("customizations", Map, "Product customisations"),
        ],
        example: r#"(workflow.apply.product.requirements (products "CUSTODY") (to.entities @attr{entity.id}))"#,
    },
    // ------------------------------------------------------------ communication
    VerbDefinition {
        name: DOMAIN_ROUTE_TO,
        short_name: "route-to-domain",
        category: VerbCategory::Communication,
        description: "Route a DSL fragment to a domain",
        parameters: &[
            required("domain", Text, "Target domain"),
            required("dsl.fragment", Text, "DSL to route"),
            optional("context", AttributeId, "Context attribute"),
            optional("priority", Text, "Routing priority"),
            optional("correlation.id", Text, "Message correlation id"),
        ],
        example: r#"(domain.route.to (domain "ubo") (dsl.fragment "(ubo.discover.owners)"))"#,
    },
    VerbDefinition {
        name: DOMAIN_COLLECT_RESULTS,
        short_name: "collect-results",
        category: VerbCategory::Communication,
        description: "Collect results from domains into one binding",
        parameters: &[
            required("from.domains", DomainList, "Source domains"),
            required("result.binding", AttributeId, "Where to bind collected results"),
            optional("aggregation.strategy", Text, "How to aggregate results"),
            optional("timeout", Duration, "Collection timeout in seconds"),
        ],
        example: r#"(domain.collect.results (from.domains "kyc" "ubo") (result.binding @attr{case.results}))"#,
    },
    VerbDefinition {
        name: DOMAIN_BROADCAST_STATE,
        short_name: "broadcast-state",
        category: VerbCategory::Communication,
        description: "Broadcast changed attributes to domains",
        parameters: &[
            required("attributes", AttributeIdList, "Attributes that changed"),
            required("to.domains", DomainList, "Target domains"),
            optional("change.type", Text, "Type of change"),
            optional("immediate", Boolean, "Broadcast immediately"),
        ],
        example: r#"(domain.broadcast.state (attributes @attr{entity.address}) (to.domains "custody"))"#,
    },
    // ------------------------------------------------------------------ product
    VerbDefinition {
        name: PRODUCTS_VALIDATE_COMPATIBILITY,
        short_name: "validate-compatibility",
        category: VerbCategory::Product,
        description: "Validate products against entities and jurisdictions",
        parameters: &[
            required("entities", AttributeIdList, "Entity attributes"),
            required("products", TextList, "Products to validate"),
            optional("jurisdictions", TextList, "Relevant jurisdictions"),
            optional("compliance.tier", Text, "Required compliance tier"),
        ],
        example: r#"(products.validate.compatibility (entities @attr{entity.id}) (products "CUSTODY" "TRADING"))"#,
    },
    VerbDefinition {
        name: PRODUCTS_CONFIGURE_CROSS_DOMAIN,
        short_name: "configure-cross-domain",
        category: VerbCategory::Product,
        description: "Configure products across the domains they affect",
        parameters: &[
            required("products", TextList, "Products to configure"),
            required("configuration", Map, "Product configuration"),
            required("affected.domains", DomainList, "Affected domains"),
            optional("dependencies", Map, "Inter-product dependencies"),
        ],
        example: r#"(products.configure.cross.domain (products "CUSTODY") (configuration (settlement "T+2")) (affected.domains "custody"))"#,
    },
];

/// Immutable verb lookup table
#[derive(Debug, Clone)]
pub struct OrchestrationVocabulary {
    verbs: BTreeMap<&'static str, VerbDefinition>,
    short_names: BTreeMap<&'static str, &'static str>,
}

impl Default for OrchestrationVocabulary {
    fn default() -> Self {
        Self::standard()
    }
}

impl OrchestrationVocabulary {
    pub fn new(definitions: impl IntoIterator<Item = VerbDefinition>) -> Self {
        let mut verbs = BTreeMap::new();
        let mut short_names = BTreeMap::new();
        for def in definitions {
            short_names.insert(def.short_name, def.name);
            verbs.insert(def.name, def);
        }
        Self { verbs, short_names }
    }

    pub fn standard() -> Self {
        Self::new(STANDARD_VERBS.iter().cloned())
    }

    /// Look up by DSL name or short name
    pub fn get(&self, name: &str) -> Option<&VerbDefinition> {
        self.verbs.get(name).or_else(|| {
            self.short_names
                .get(name)
                .and_then(|full| self.verbs.get(full))
        })
    }

    pub fn is_approved(&self, verb: &str) -> bool {
        self.verbs.contains_key(verb)
    }

    /// Verbs of one category, sorted by name
    pub fn verbs_in(&self, category: VerbCategory) -> Vec<&VerbDefinition> {
        self.verbs
            .values()
            .filter(|def| def.category == category)
            .collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &VerbDefinition> {
        self.verbs.values()
    }

    pub fn len(&self) -> usize {
        self.verbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verbs.is_empty()
    }

    /// Verbs used by a document, in order of first appearance. Every
    /// top-level form must be an approved verb.
    pub fn validate_document(&self, dsl: &str) -> Result<Vec<String>, VerbError> {
        let mut used: Vec<String> = Vec::new();
        let mut unknown = Vec::new();

        for form in parse_document(dsl)? {
            let line = form.location.line;
            let verb = form.expr.head().ok_or_else(|| VerbError::NotAVerbForm {
                line,
                found: form.expr.render(),
            })?;
            if !self.is_approved(verb) {
                unknown.push(VerbError::UnknownVerb {
                    verb: verb.to_string(),
                    line,
                });
            } else if !used.iter().any(|v| v == verb) {
                used.push(verb.to_string());
            }
        }

        match unknown.len() {
            0 => Ok(used),
            1 => Err(unknown.remove(0)),
            _ => Err(VerbError::UnknownVerbs(
                unknown.iter().map(ToString::to_string).collect(),
            )),
        }
    }

    /// Markdown reference of every verb, grouped by category
    pub fn generate_documentation(&self) -> String {
        let mut doc = String::from("# Orchestration DSL Vocabulary\n\n");
        doc.push_str(
            "Orchestration verbs for cross-domain coordination and shared state management.\n\n",
        );

        for category in VerbCategory::all() {
            let verbs = self.verbs_in(category);
            if verbs.is_empty() {
                continue;
            }
            let title = category.as_str();
            let mut chars = title.chars();
            let title: String = chars
                .next()
                .map(|c| c.to_uppercase().chain(chars).collect())
                .unwrap_or_default();
            doc.push_str(&format!("## {} Verbs\n\n", title));

            for verb in verbs {
                doc.push_str(&format!("### {} (`{}`)\n\n", verb.name, verb.short_name));
                doc.push_str(&format!("{}\n\n", verb.description));
                if !verb.parameters.is_empty() {
                    doc.push_str("**Parameters**:\n");
                    for param in verb.parameters {
                        let required = if param.required { " (required)" } else { "" };
                        doc.push_str(&format!(
                            "- `{}` ({}){}: {}\n",
                            param.name,
                            param.kind.as_str(),
                            required,
                            param.description
                        ));
                    }
                    doc.push('\n');
                }
                doc.push_str("**Example**:\n```lisp\n");
                doc.push_str(verb.example);
                doc.push_str("\n```\n\n");
            }
        }
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_vocabulary_shape() {
        let vocab = OrchestrationVocabulary::standard();
        assert_eq!(vocab.len(), 17);
        assert_eq!(vocab.verbs_in(VerbCategory::Context).len(), 4);
        assert_eq!(vocab.verbs_in(VerbCategory::State).len(), 4);
        assert_eq!(vocab.verbs_in(VerbCategory::Workflow).len(), 4);
        assert_eq!(vocab.verbs_in(VerbCategory::Communication).len(), 3);
        assert_eq!(vocab.verbs_in(VerbCategory::Product).len(), 2);
    }

    #[test]
    fn test_lookup_by_short_name() {
        let vocab = OrchestrationVocabulary::standard();
        let def = vocab.get("execute-subdomain").unwrap();
        assert_eq!(def.name, WORKFLOW_EXECUTE_SUBDOMAIN);
        assert_eq!(
            def.required_parameters().collect::<Vec<_>>(),
            vec!["domain", "entity.target"]
        );
        assert!(!vocab.is_approved("execute-subdomain"));
        assert!(vocab.is_approved(WORKFLOW_EXECUTE_SUBDOMAIN));
    }

    #[test]
    fn test_every_example_validates() {
        let vocab = OrchestrationVocabulary::standard();
        for def in vocab.all() {
            let used = vocab.validate_document(def.example).unwrap();
            assert_eq!(used, vec![def.name.to_string()]);
        }
    }

    #[test]
    fn test_unknown_verbs_carry_line_numbers() {
        let vocab = OrchestrationVocabulary::standard();
        let err = vocab
            .validate_document("(workflow.wait.for.completion (workflows \"kyc\"))\n(kyc.magic)")
            .unwrap_err();
        assert_eq!(err.to_string(), "line 2: unknown orchestration verb 'kyc.magic'");

        let err = vocab.validate_document("(a.b)\n(c.d)").unwrap_err();
        match err {
            VerbError::UnknownVerbs(messages) => {
                assert_eq!(messages.len(), 2);
                assert!(messages[1].starts_with("line 2"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_documentation_lists_every_verb() {
        let vocab = OrchestrationVocabulary::standard();
        let doc = vocab.generate_documentation();
        assert!(doc.starts_with("# Orchestration DSL Vocabulary"));
        assert!(doc.contains("## Communication Verbs"));
        for def in vocab.all() {
            assert!(doc.contains(&format!("### {}", def.name)));
        }
    }
}
