//! Template Domain
//!
//! Keyword/template implementation of [`DomainPlugin`]. Each domain carries a
//! small table of verbs; an instruction selects the first verb whose keyword
//! it mentions, and the fragment echoes the instruction plus the context
//! values that verb is interested in.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{DomainContext, DomainError, DomainPlugin, DomainVocabulary, GenerationResponse};
use crate::dsl::DslForm;

/// Static description of a standard domain
pub struct DomainDefinition {
    pub name: &'static str,
    pub category: &'static str,
    pub verbs: &'static [VerbDefinition],
    pub states: &'static [&'static str],
}

/// One verb and the keywords that select it
pub struct VerbDefinition {
    pub verb: &'static str,
    pub keywords: &'static [&'static str],
    /// Context keys copied into the fragment
    pub context_keys: &'static [&'static str],
}

const IDENTITY_KEYS: &[&str] = &["entity_name", "entity_type", "jurisdiction"];

pub const STANDARD_DOMAINS: &[DomainDefinition] = &[
    DomainDefinition {
        name: "onboarding",
        category: "lifecycle",
        verbs: &[
            VerbDefinition {
                verb: "case.create",
                keywords: &["case", "create", "client", "onboard"],
                context_keys: &["cbu_id", "entity_name", "entity_type"],
            },
            VerbDefinition {
                verb: "products.add",
                keywords: &["product", "add"],
                context_keys: &["products"],
            },
            VerbDefinition {
                verb: "case.update",
                keywords: &["update", "amend"],
                context_keys: &["cbu_id"],
            },
            VerbDefinition {
                verb: "case.approve",
                keywords: &["approve", "complete"],
                context_keys: &["cbu_id"],
            },
        ],
        states: &["CREATED", "PRODUCTS_ADDED", "KYC_STARTED", "COMPLETE"],
    },
    DomainDefinition {
        name: "kyc",
        category: "due-diligence",
        verbs: &[
            VerbDefinition {
                verb: "kyc.collect.document",
                keywords: &["document", "passport", "collect"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "kyc.verify.identity",
                keywords: &["verify", "verification", "identity"],
                context_keys: IDENTITY_KEYS,
            },
            VerbDefinition {
                verb: "kyc.assess.risk",
                keywords: &["risk"],
                context_keys: &["risk_profile", "compliance_tier"],
            },
            VerbDefinition {
                verb: "kyc.start",
                keywords: &["start", "begin", "kyc"],
                context_keys: IDENTITY_KEYS,
            },
        ],
        states: &["CREATED", "COLLECTING", "VERIFYING", "APPROVED"],
    },
    DomainDefinition {
        name: "ubo",
        category: "due-diligence",
        verbs: &[
            VerbDefinition {
                verb: "ubo.calculate.ownership",
                keywords: &["calculate", "percent", "threshold"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "ubo.resolve.prongs",
                keywords: &["prong", "control"],
                context_keys: &["entity_type", "jurisdiction"],
            },
            VerbDefinition {
                verb: "ubo.verify",
                keywords: &["verify"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "ubo.identify.owners",
                keywords: &["owner", "beneficial", "identify", "shareholder", "ownership"],
                context_keys: &["entity_name", "entity_type"],
            },
        ],
        states: &["CREATED", "DISCOVERING", "RESOLVED", "VERIFIED"],
    },
    DomainDefinition {
        name: "trust-kyc",
        category: "due-diligence",
        verbs: &[
            VerbDefinition {
                verb: "trust.verify.deed",
                keywords: &["deed", "verify"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "trust.identify.parties",
                keywords: &["trustee", "settlor", "beneficiar", "protector", "part"],
                context_keys: &["entity_name", "jurisdiction"],
            },
        ],
        states: &["CREATED", "PARTIES_IDENTIFIED", "DEED_VERIFIED"],
    },
    DomainDefinition {
        name: "custody",
        category: "product",
        verbs: &[
            VerbDefinition {
                verb: "custody.setup.safekeeping",
                keywords: &["safekeeping", "securities", "asset"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "custody.configure.settlement",
                keywords: &["settlement", "settle"],
                context_keys: &["jurisdiction"],
            },
            VerbDefinition {
                verb: "custody.open.account",
                keywords: &["account", "open", "custody"],
                context_keys: &["entity_name", "products"],
            },
        ],
        states: &["CREATED", "ACCOUNT_OPEN", "ACTIVE"],
    },
    DomainDefinition {
        name: "trading",
        category: "product",
        verbs: &[
            VerbDefinition {
                verb: "trading.configure.execution",
                keywords: &["execution", "order", "market", "buy", "sell"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "trading.setup.profile",
                keywords: &["trade", "trading", "profile"],
                context_keys: &["entity_name", "products"],
            },
        ],
        states: &["CREATED", "PROFILE_READY", "ACTIVE"],
    },
    DomainDefinition {
        name: "fund-accounting",
        category: "product",
        verbs: &[
            VerbDefinition {
                verb: "fund.accounting.configure.nav",
                keywords: &["nav", "valuation"],
                context_keys: &["fund_id"],
            },
            VerbDefinition {
                verb: "fund.accounting.setup",
                keywords: &["accounting", "setup", "fund"],
                context_keys: &["entity_name", "fund_id"],
            },
        ],
        states: &["CREATED", "CONFIGURED"],
    },
    DomainDefinition {
        name: "compliance",
        category: "compliance",
        verbs: &[
            VerbDefinition {
                verb: "compliance.screen",
                keywords: &["screen", "sanction", "pep"],
                context_keys: IDENTITY_KEYS,
            },
            VerbDefinition {
                verb: "compliance.report",
                keywords: &["report", "filing", "regulat", "compliance"],
                context_keys: &["jurisdiction", "compliance_tier"],
            },
        ],
        states: &["CREATED", "SCREENED", "REPORTED"],
    },
    DomainDefinition {
        name: "hedge-fund-investor",
        category: "investor",
        verbs: &[
            VerbDefinition {
                verb: "investor.verify.accreditation",
                keywords: &["accredit"],
                context_keys: &["investor_id", "jurisdiction"],
            },
            VerbDefinition {
                verb: "investor.subscribe",
                keywords: &["subscri", "invest", "fund"],
                context_keys: &["investor_id", "fund_id", "products"],
            },
            VerbDefinition {
                verb: "investor.register",
                keywords: &["investor", "register"],
                context_keys: &["entity_name", "investor_id"],
            },
        ],
        states: &["CREATED", "REGISTERED", "SUBSCRIBED"],
    },
    DomainDefinition {
        name: "us-compliance",
        category: "compliance",
        verbs: &[
            VerbDefinition {
                verb: "us.ofac.screen",
                keywords: &["ofac", "sanction", "screen"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "us.fincen.cdd",
                keywords: &["beneficial", "ownership", "cdd", "fincen"],
                context_keys: &["entity_name", "entity_type"],
            },
            VerbDefinition {
                verb: "us.fincen.cip",
                keywords: &["cip", "identity", "compliance"],
                context_keys: IDENTITY_KEYS,
            },
        ],
        states: &["CREATED", "CIP_COMPLETE", "CDD_COMPLETE"],
    },
    DomainDefinition {
        name: "eu-compliance",
        category: "compliance",
        verbs: &[
            VerbDefinition {
                verb: "eu.register.ubo",
                keywords: &["register", "beneficial"],
                context_keys: &["entity_name", "jurisdiction"],
            },
            VerbDefinition {
                verb: "eu.amld.cdd",
                keywords: &["cdd", "diligence", "amld", "compliance"],
                context_keys: IDENTITY_KEYS,
            },
        ],
        states: &["CREATED", "CDD_COMPLETE", "REGISTERED"],
    },
    DomainDefinition {
        name: "uk-compliance",
        category: "compliance",
        verbs: &[
            VerbDefinition {
                verb: "uk.psc.check",
                keywords: &["psc", "control", "significant"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "uk.mlr.cdd",
                keywords: &["cdd", "diligence", "compliance"],
                context_keys: IDENTITY_KEYS,
            },
        ],
        states: &["CREATED", "CDD_COMPLETE"],
    },
    DomainDefinition {
        name: "swiss-compliance",
        category: "compliance",
        verbs: &[
            VerbDefinition {
                verb: "ch.form.a",
                keywords: &["beneficial", "form"],
                context_keys: &["entity_name"],
            },
            VerbDefinition {
                verb: "ch.vsb.identify",
                keywords: &["identif", "vsb", "compliance"],
                context_keys: IDENTITY_KEYS,
            },
        ],
        states: &["CREATED", "IDENTIFIED"],
    },
];

#[derive(Debug, Clone)]
struct VerbTemplate {
    verb: String,
    keywords: Vec<String>,
    context_keys: Vec<String>,
}

/// Keyword-selected, template-rendered domain plugin
#[derive(Debug, Clone)]
pub struct TemplateDomain {
    name: String,
    vocabulary: DomainVocabulary,
    templates: Vec<VerbTemplate>,
}

impl TemplateDomain {
    /// Ad-hoc domain whose verbs carry no keywords; the first verb is the default
    pub fn new(name: impl Into<String>, verbs: &[&str]) -> Self {
        let templates = verbs
            .iter()
            .map(|verb| VerbTemplate {
                verb: verb.to_string(),
                keywords: Vec::new(),
                context_keys: IDENTITY_KEYS.iter().map(|k| k.to_string()).collect(),
            })
            .collect::<Vec<_>>();

        Self {
            name: name.into(),
            vocabulary: DomainVocabulary {
                verbs: verbs.iter().map(|v| v.to_string()).collect(),
                categories: vec!["custom".to_string()],
                states: vec!["CREATED".to_string(), "COMPLETED".to_string()],
            },
            templates,
        }
    }

    pub fn from_definition(definition: &DomainDefinition) -> Self {
        let templates = definition
            .verbs
            .iter()
            .map(|v| VerbTemplate {
                verb: v.verb.to_string(),
                keywords: v.keywords.iter().map(|k| k.to_string()).collect(),
                context_keys: v.context_keys.iter().map(|k| k.to_string()).collect(),
            })
            .collect::<Vec<_>>();

        Self {
            name: definition.name.to_string(),
            vocabulary: DomainVocabulary {
                verbs: templates.iter().map(|t| t.verb.clone()).collect(),
                categories: vec![definition.category.to_string()],
                states: definition.states.iter().map(|s| s.to_string()).collect(),
            },
            templates,
        }
    }

    /// Pick the verb for an instruction: first keyword hit, else the last
    /// (most general) verb in the table.
    fn select(&self, instruction: &str) -> Option<(&VerbTemplate, bool)> {
        let lowered = instruction.to_lowercase();
        self.templates
            .iter()
            .find(|t| t.keywords.iter().any(|k| lowered.contains(k.as_str())))
            .map(|t| (t, true))
            .or_else(|| self.templates.last().map(|t| (t, false)))
    }
}

#[async_trait]
impl DomainPlugin for TemplateDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn vocabulary(&self) -> &DomainVocabulary {
        &self.vocabulary
    }

    async fn generate_dsl(
        &self,
        instruction: &str,
        context: &DomainContext,
    ) -> Result<GenerationResponse, DomainError> {
        let instruction = instruction.trim();
        if instruction.is_empty() {
            return Err(DomainError::GenerationFailed {
                domain: self.name.clone(),
                message: "empty instruction".to_string(),
            });
        }

        let (template, keyword_hit) =
            self.select(instruction)
                .ok_or_else(|| DomainError::GenerationFailed {
                    domain: self.name.clone(),
                    message: "domain has no verbs".to_string(),
                })?;

        let mut form = DslForm::new(&template.verb).text("instruction", instruction);
        let mut parameters = BTreeMap::new();
        for key in &template.context_keys {
            let Some(value) = context.business_context.get(key) else {
                continue;
            };
            let param = key.replace('_', ".");
            form = match value {
                serde_json::Value::String(s) => {
                    parameters.insert(param.clone(), s.clone());
                    form.text(&param, s)
                }
                serde_json::Value::Array(items) => {
                    let texts: Vec<String> = items
                        .iter()
                        .map(|item| match item {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    parameters.insert(param.clone(), texts.join(","));
                    form.texts(&param, texts)
                }
                serde_json::Value::Null => continue,
                other => {
                    parameters.insert(param.clone(), other.to_string());
                    form.raw(&param, other.to_string())
                }
            };
        }

        Ok(GenerationResponse {
            fragment: form.render(),
            matched_verb: Some(template.verb.clone()),
            parameters,
            is_valid: true,
            confidence: if keyword_hit { 0.9 } else { 0.5 },
            explanation: if keyword_hit {
                format!("instruction matched {} keywords", template.verb)
            } else {
                format!("no keyword match, defaulted to {}", template.verb)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kyc() -> TemplateDomain {
        let definition = STANDARD_DOMAINS
            .iter()
            .find(|d| d.name == "kyc")
            .unwrap();
        TemplateDomain::from_definition(definition)
    }

    #[tokio::test]
    async fn test_keyword_selects_verb() {
        let ctx = DomainContext::new("kyc", "s-1")
            .with_context("entity_name", json!("Acme Ltd"))
            .with_context("jurisdiction", json!("US"));

        let response = kyc()
            .generate_dsl("Collect passport copies", &ctx)
            .await
            .unwrap();

        assert_eq!(response.matched_verb.as_deref(), Some("kyc.collect.document"));
        assert_eq!(
            response.fragment,
            "(kyc.collect.document\n  (instruction \"Collect passport copies\")\n  (entity.name \"Acme Ltd\"))"
        );
        assert!(kyc().validate_verbs(&response.fragment).is_ok());
    }

    #[tokio::test]
    async fn test_default_verb_has_lower_confidence() {
        let ctx = DomainContext::new("kyc", "s-1");
        let response = kyc().generate_dsl("do the thing", &ctx).await.unwrap();
        assert_eq!(response.matched_verb.as_deref(), Some("kyc.start"));
        assert!(response.confidence < 0.9);
    }

    #[tokio::test]
    async fn test_empty_instruction_fails() {
        let ctx = DomainContext::new("kyc", "s-1");
        let err = kyc().generate_dsl("   ", &ctx).await.unwrap_err();
        assert!(matches!(err, DomainError::GenerationFailed { .. }));
    }
}
