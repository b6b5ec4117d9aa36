//! Instruction routing
//!
//! Free-text instructions reach domains in two ways:
//!
//! - [`DomainRouter::route`] picks the target domains for a domain-level
//!   instruction by keyword. Only the session's planned domains are
//!   candidates; when nothing matches, the primary domain gets it.
//! - [`translate_instruction`] turns a small set of orchestration phrases
//!   ("initialize shared state", "execute kyc", ...) into orchestration verb
//!   DSL for the verb executor.
//!
//! Keywords match at word starts, so `verif` matches "verify" and
//! "verification" but `id` would not match "valid".

use std::collections::BTreeSet;

use tracing::debug;

use crate::analysis::{
    COMPLIANCE, CUSTODY, FUND_ACCOUNTING, HEDGE_FUND_INVESTOR, KYC, ONBOARDING, TRADING,
    TRUST_KYC, UBO,
};
use crate::dsl::DslForm;
use crate::error::{OrchestrationError, OrchestrationResult};
use crate::session::OrchestrationSession;
use crate::vocabulary::{
    DOMAIN_BROADCAST_STATE, DOMAIN_COLLECT_RESULTS, PRODUCTS_VALIDATE_COMPATIBILITY,
    STATE_INITIALIZE_SHARED, STATE_SYNC_ATTRIBUTES, WORKFLOW_EXECUTE_SUBDOMAIN,
};

/// Where a keyword hit sends the instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Domain(String),
    /// Every planned compliance domain (`compliance`, `us-compliance`, ...)
    Compliance,
}

impl RouteTarget {
    fn resolve(&self, session: &OrchestrationSession) -> Vec<String> {
        match self {
            RouteTarget::Domain(domain) if session.active_domains.contains_key(domain) => {
                vec![domain.clone()]
            }
            RouteTarget::Domain(_) => Vec::new(),
            RouteTarget::Compliance => session
                .active_domains
                .keys()
                .filter(|d| is_compliance_domain(d))
                .cloned()
                .collect(),
        }
    }
}

pub fn is_compliance_domain(domain: &str) -> bool {
    domain == COMPLIANCE || domain.ends_with("-compliance")
}

#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub target: RouteTarget,
    /// Lowercase phrases; every word of a phrase matches a word start
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DomainRouter {
    rules: Vec<KeywordRule>,
}

impl Default for DomainRouter {
    fn default() -> Self {
        Self::standard()
    }
}

impl DomainRouter {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, target: RouteTarget, keywords: &[&str]) -> Self {
        self.rules.push(KeywordRule {
            target,
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        });
        self
    }

    pub fn with_domain(self, domain: &str, keywords: &[&str]) -> Self {
        self.with_rule(RouteTarget::Domain(domain.to_string()), keywords)
    }

    pub fn standard() -> Self {
        Self::new()
            .with_domain(ONBOARDING, &["onboard", "case", "cbu", "client"])
            .with_domain(
                KYC,
                &["kyc", "know your customer", "identity", "verif", "document", "passport"],
            )
            .with_domain(
                UBO,
                &["ubo", "beneficial owner", "ownership", "shareholder", "beneficiar"],
            )
            .with_domain(TRUST_KYC, &["trust", "settlor", "protector"])
            .with_domain(
                HEDGE_FUND_INVESTOR,
                &["investor", "investment", "subscription", "subscribe", "redemption", "hedge", "accredited"],
            )
            .with_rule(
                RouteTarget::Compliance,
                &["complian", "regulat", "report", "filing", "sanction", "screening"],
            )
            .with_domain(CUSTODY, &["custody", "safekeep", "asset", "securities", "account"])
            .with_domain(
                TRADING,
                &["trade", "trading", "execution", "order", "market", "buy", "sell"],
            )
            .with_domain(FUND_ACCOUNTING, &["fund accounting", "nav", "valuation"])
    }

    /// Target domains in stage order, deduplicated. Never empty: an
    /// instruction nothing matches goes to the primary domain.
    pub fn route(&self, instruction: &str, session: &OrchestrationSession) -> Vec<String> {
        let words = words(instruction);
        let matched: BTreeSet<(usize, String)> = self
            .rules
            .iter()
            .filter(|rule| rule.keywords.iter().any(|k| mentions(&words, k)))
            .flat_map(|rule| rule.target.resolve(session))
            .map(|domain| {
                let stage = session.execution_plan.stage_of(&domain).unwrap_or(usize::MAX);
                (stage, domain)
            })
            .collect();

        if matched.is_empty() {
            debug!(
                session_id = %session.session_id,
                primary = %session.primary_domain,
                "no domain keyword matched, routing to primary domain"
            );
            return vec![session.primary_domain.clone()];
        }

        let targets: Vec<String> = matched.into_iter().map(|(_, domain)| domain).collect();
        debug!(session_id = %session.session_id, targets = ?targets, "instruction routed");
        targets
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when consecutive words start with each word of `phrase`
fn mentions(words: &[String], phrase: &str) -> bool {
    let parts: Vec<&str> = phrase.split_whitespace().collect();
    if parts.is_empty() || parts.len() > words.len() {
        return false;
    }
    words.windows(parts.len()).any(|window| {
        window
            .iter()
            .zip(&parts)
            .all(|(word, part)| word.starts_with(part))
    })
}

fn mentions_all(words: &[String], phrases: &[&str]) -> bool {
    phrases.iter().all(|p| mentions(words, p))
}

fn attr(id: &str) -> String {
    format!("@attr{{{}}}", id)
}

fn attrs(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|id| attr(id)).collect()
}

/// Map an orchestration phrase onto verb DSL
///
/// Recognised phrases, first match wins:
///
/// | Phrase                     | Verb                                  |
/// |----------------------------|---------------------------------------|
/// | initialize shared state    | `state.initialize.shared`             |
/// | execute ... kyc            | `workflow.execute.subdomain` (kyc)    |
/// | execute ... ubo            | `workflow.execute.subdomain` (ubo)    |
/// | validate ... products      | `products.validate.compatibility`     |
/// | sync ... state             | `state.sync.attributes`               |
/// | collect ... results        | `domain.collect.results`              |
/// | broadcast ... state        | `domain.broadcast.state`              |
pub fn translate_instruction(
    instruction: &str,
    session: &OrchestrationSession,
) -> OrchestrationResult<String> {
    let words = words(instruction);
    let shared = &session.shared_context;
    let domains = session.domain_names();

    let form = if mentions(&words, "initiali shared state") {
        DslForm::new(STATE_INITIALIZE_SHARED)
            .text("session.id", &session.session_id)
            .raw("primary.entity", attr("entity.primary.id"))
            .raws(
                "shared.attributes",
                attrs(&["entity.legal_name", "entity.jurisdiction", "entity.risk_profile"]),
            )
            .texts("accessible.domains", &domains)
    } else if mentions_all(&words, &["execut", "kyc"]) {
        DslForm::new(WORKFLOW_EXECUTE_SUBDOMAIN)
            .text("domain", KYC)
            .text("template", "enhanced-kyc-workflow")
            .raw("entity.target", attr("entity.primary.id"))
            .raw("depends.on", attr("onboarding.complete"))
            .raw("result.binding", attr("kyc.completion.status"))
    } else if mentions_all(&words, &["execut", "ubo"]) {
        DslForm::new(WORKFLOW_EXECUTE_SUBDOMAIN)
            .text("domain", UBO)
            .text(
                "template",
                format!("{}-ubo-workflow", shared.entity_type.to_lowercase()),
            )
            .raw("entity.target", attr("entity.primary.id"))
            .raw("depends.on", attr("kyc.completion.status"))
            .raw("result.binding", attr("ubo.analysis.complete"))
    } else if mentions_all(&words, &["validat", "product"]) {
        let form = DslForm::new(PRODUCTS_VALIDATE_COMPATIBILITY)
            .raw("entities", attr("entity.primary.id"))
            .texts("products", &shared.products);
        let form = if shared.jurisdiction.is_empty() {
            form
        } else {
            form.text("jurisdictions", &shared.jurisdiction)
        };
        form.text("compliance.tier", shared.compliance_tier.as_str())
    } else if mentions_all(&words, &["sync", "state"]) {
        DslForm::new(STATE_SYNC_ATTRIBUTES)
            .raws("attributes", attrs(&["entity.legal_name", "entity.address"]))
            .texts("between.domains", &domains)
            .text("conflict.resolution", "SOURCE_WINS")
            .flag("validation.required", true)
    } else if mentions_all(&words, &["collect", "result"]) {
        DslForm::new(DOMAIN_COLLECT_RESULTS)
            .texts("from.domains", &domains)
            .raw("result.binding", attr("orchestration.collected.results"))
            .text("aggregation.strategy", "MERGE")
    } else if mentions_all(&words, &["broadcast", "state"]) {
        DslForm::new(DOMAIN_BROADCAST_STATE)
            .raws(
                "attributes",
                attrs(&["entity.legal_name", "entity.jurisdiction"]),
            )
            .texts("to.domains", &domains)
            .text("change.type", "UPDATE")
    } else {
        return Err(OrchestrationError::InstructionNotUnderstood(
            instruction.trim().to_string(),
        ));
    };

    Ok(form.render())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalysisInput, ContextAnalyzer};
    use crate::dsl::VerbForm;
    use crate::planner::ExecutionPlanner;
    use crate::session::SharedContext;
    use chrono::Utc;

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
        let plan = ExecutionPlanner::default().plan(&analysis).unwrap();
        let shared = SharedContext {
            entity_type: analysis.entity_type.as_str().to_string(),
            jurisdiction: jurisdiction.to_string(),
            products,
            compliance_tier: analysis.compliance_tier,
            ..Default::default()
        };
        OrchestrationSession::new(
            "route-1",
            shared,
            analysis,
            plan,
            "",
            std::time::Duration::from_secs(60),
            Utc::now(),
        )
    }

    #[test]
    fn test_routes_by_keyword_in_stage_order() {
        let s = session("CORPORATE", "US", &["CUSTODY"]);
        let router = DomainRouter::standard();

        assert_eq!(
            router.route("Open a custody account after identity verification", &s),
            vec!["kyc", "custody"]
        );
        assert_eq!(
            router.route("Find the beneficial owners and run sanctions screening", &s),
            vec!["ubo", "us-compliance"]
        );
    }

    #[test]
    fn test_inactive_domains_are_never_targets() {
        let s = session("INDIVIDUAL", "", &["HEDGE_FUND_INVESTMENT"]);
        let router = DomainRouter::standard();

        assert_eq!(router.route("Place a trade order", &s), vec!["hedge-fund-investor"]);
        assert_eq!(
            router.route("Process the investor subscription", &s),
            vec!["hedge-fund-investor"]
        );
    }

    #[test]
    fn test_keywords_match_word_starts_only() {
        let words = words("Please validate the passport");
        assert!(mentions(&words, "valid"));
        assert!(mentions(&words, "passport"));
        assert!(!mentions(&words, "id"));
        assert!(mentions(&super::words("know your customer checks"), "know your customer"));
        assert!(!mentions(&super::words("know the customer"), "know your customer"));
    }

    #[test]
    fn test_translate_phrases() {
        let s = session("CORPORATE", "US", &["CUSTODY", "TRADING"]);

        let ubo = translate_instruction("Execute the UBO workflow", &s).unwrap();
        let forms = VerbForm::parse_all(&ubo).unwrap();
        assert_eq!(forms[0].verb, WORKFLOW_EXECUTE_SUBDOMAIN);
        assert_eq!(forms[0].text("template").unwrap(), "corporate-ubo-workflow");
        assert_eq!(forms[0].text("depends.on").unwrap(), "kyc.completion.status");

        let validate = translate_instruction("validate products", &s).unwrap();
        let forms = VerbForm::parse_all(&validate).unwrap();
        assert_eq!(forms[0].texts("products"), vec!["CUSTODY", "TRADING"]);
        assert_eq!(forms[0].text("jurisdictions").unwrap(), "US");
        assert_eq!(forms[0].text("compliance.tier").unwrap(), "ENHANCED");

        let shared = translate_instruction("Initialize shared state", &s).unwrap();
        let forms = VerbForm::parse_all(&shared).unwrap();
        assert_eq!(forms[0].texts("accessible.domains")[0], "onboarding");
    }

    #[test]
    fn test_unknown_phrase_is_rejected() {
        let s = session("CORPORATE", "US", &["CUSTODY"]);
        let err = translate_instruction("  make it so  ", &s).unwrap_err();
        assert!(matches!(err, OrchestrationError::InstructionNotUnderstood(ref text) if text == "make it so"));
    }
}
