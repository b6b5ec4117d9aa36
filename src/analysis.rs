//! Context Analyzer
//!
//! Rule-table driven: given entity type, jurisdiction, products and workflow
//! type it decides the primary domain, the full set of required domains and
//! the dependency map between them.
//!
//! ## Rules
//! - every case needs `kyc`; non-individuals add `ubo` behind the
//!   entity-specific KYC variant (`trust-kyc` for trusts)
//! - each product adds its own domain, depending on `onboarding` when that
//!   domain is required, and on another product domain where relevant
//!   (trading and fund accounting need custody)
//! - the jurisdiction adds its compliance domain behind `kyc` (and `ubo`)
//! - a dependency value is always a required domain

use dsl_types::{ComplianceTier, Complexity, ContextAnalysis, EntityType, WorkflowType};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::error::AnalysisError;

pub const ONBOARDING: &str = "onboarding";
pub const KYC: &str = "kyc";
pub const UBO: &str = "ubo";
pub const TRUST_KYC: &str = "trust-kyc";
pub const CUSTODY: &str = "custody";
pub const TRADING: &str = "trading";
pub const FUND_ACCOUNTING: &str = "fund-accounting";
pub const COMPLIANCE: &str = "compliance";
pub const HEDGE_FUND_INVESTOR: &str = "hedge-fund-investor";

/// ISO codes of the 27 EU member states
pub const EU_MEMBER_STATES: &[&str] = &[
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
];

pub fn is_eu_jurisdiction(code: &str) -> bool {
    let code = code.trim().to_uppercase();
    EU_MEMBER_STATES.contains(&code.as_str())
}

/// Regulatory family of a jurisdiction code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JurisdictionClass {
    Unspecified,
    Us,
    Eu(String),
    Gb,
    Ch,
    /// Well-formed code with no dedicated compliance rule set
    Other(String),
}

impl JurisdictionClass {
    pub fn classify(code: &str) -> Result<Self, AnalysisError> {
        let code = code.trim().to_uppercase();
        if code.is_empty() {
            return Ok(Self::Unspecified);
        }
        if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(AnalysisError::UnsupportedJurisdiction { jurisdiction: code });
        }
        Ok(match code.as_str() {
            "US" => Self::Us,
            "GB" | "UK" => Self::Gb,
            "CH" => Self::Ch,
            _ if is_eu_jurisdiction(&code) => Self::Eu(code),
            _ => Self::Other(code),
        })
    }

    pub fn compliance_domain(&self) -> Option<&'static str> {
        match self {
            Self::Us => Some("us-compliance"),
            Self::Eu(_) => Some("eu-compliance"),
            Self::Gb => Some("uk-compliance"),
            Self::Ch => Some("swiss-compliance"),
            Self::Unspecified | Self::Other(_) => None,
        }
    }

    /// US and EU regimes mandate enhanced diligence for these flows
    pub fn mandates_enhanced(&self) -> bool {
        matches!(self, Self::Us | Self::Eu(_))
    }
}

/// Domain that services a product code
pub fn product_domain(product: &str) -> Result<&'static str, AnalysisError> {
    let lowered = product.trim().to_lowercase().replace(['_', '-'], " ");
    let has = |needle: &str| lowered.contains(needle);

    let domain = if has("custody") || has("safekeeping") {
        CUSTODY
    } else if has("trading") || has("execution") {
        TRADING
    } else if has("fund accounting") || has("accounting") {
        FUND_ACCOUNTING
    } else if has("hedge") || has("investment") || has("subscription") {
        HEDGE_FUND_INVESTOR
    } else if has("compliance") || has("reporting") {
        COMPLIANCE
    } else {
        return Err(AnalysisError::UnsupportedProduct {
            product: product.to_string(),
        });
    };
    Ok(domain)
}

pub fn is_investor_product(product: &str) -> bool {
    matches!(product_domain(product), Ok(HEDGE_FUND_INVESTOR))
}

/// Case description the analyzer works from
#[derive(Debug, Clone, Default)]
pub struct AnalysisInput<'a> {
    pub entity_type: &'a str,
    pub jurisdiction: &'a str,
    pub products: &'a [String],
    pub workflow_type: WorkflowType,
    pub risk_profile: Option<&'a str>,
    pub requested_tier: Option<ComplianceTier>,
}

#[derive(Debug, Default)]
struct DomainGraph {
    domains: BTreeSet<String>,
    dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DomainGraph {
    fn require(&mut self, domain: &str) {
        self.domains.insert(domain.to_string());
    }

    fn depends(&mut self, domain: &str, on: &str) {
        self.require(domain);
        self.require(on);
        self.dependencies
            .entry(domain.to_string())
            .or_default()
            .insert(on.to_string());
    }

    fn has(&self, domain: &str) -> bool {
        self.domains.contains(domain)
    }
}

/// Stateless, deterministic context analyzer
#[derive(Debug, Clone, Default)]
pub struct ContextAnalyzer;

impl ContextAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, input: &AnalysisInput<'_>) -> Result<ContextAnalysis, AnalysisError> {
        let entity_type = EntityType::from_code(input.entity_type).ok_or_else(|| {
            AnalysisError::UnsupportedEntityType {
                entity_type: input.entity_type.to_string(),
            }
        })?;
        let jurisdiction = JurisdictionClass::classify(input.jurisdiction)?;

        let mut product_domains = Vec::with_capacity(input.products.len());
        for product in input.products {
            product_domains.push(product_domain(product)?);
        }

        let primary = primary_domain(input.workflow_type, &product_domains);
        let mut graph = DomainGraph::default();
        graph.require(primary);
        graph.require(KYC);

        // KYC runs once the case exists
        if graph.has(ONBOARDING) {
            graph.depends(KYC, ONBOARDING);
        }

        match entity_type {
            EntityType::Individual => {}
            EntityType::Corporate | EntityType::Partnership => graph.depends(UBO, KYC),
            EntityType::Trust => {
                graph.depends(TRUST_KYC, KYC);
                graph.depends(UBO, TRUST_KYC);
            }
        }

        for domain in &product_domains {
            add_product_rules(&mut graph, domain, entity_type);
        }

        if let Some(compliance) = jurisdiction.compliance_domain() {
            graph.depends(compliance, KYC);
            if entity_type.requires_ubo() {
                graph.depends(compliance, UBO);
            }
        }

        let compliance_tier = compliance_tier(&jurisdiction, input);
        let required_domains: Vec<String> = graph.domains.iter().cloned().collect();
        let estimated_complexity = complexity(&required_domains);

        debug!(
            primary = primary,
            domains = ?required_domains,
            complexity = %estimated_complexity,
            "context analyzed"
        );

        Ok(ContextAnalysis {
            primary_domain: primary.to_string(),
            required_domains,
            dependencies: graph
                .dependencies
                .into_iter()
                .map(|(domain, deps)| (domain, deps.into_iter().collect()))
                .collect(),
            estimated_complexity,
            entity_type,
            compliance_tier,
            products: input.products.to_vec(),
        })
    }
}

fn primary_domain(workflow: WorkflowType, product_domains: &[&str]) -> &'static str {
    let any_investor = product_domains.contains(&HEDGE_FUND_INVESTOR);
    let only_investor =
        !product_domains.is_empty() && product_domains.iter().all(|d| *d == HEDGE_FUND_INVESTOR);

    if only_investor || (workflow == WorkflowType::Investment && any_investor) {
        HEDGE_FUND_INVESTOR
    } else {
        ONBOARDING
    }
}

fn add_product_rules(graph: &mut DomainGraph, domain: &str, entity_type: EntityType) {
    graph.require(domain);
    if domain != HEDGE_FUND_INVESTOR && graph.has(ONBOARDING) {
        graph.depends(domain, ONBOARDING);
    }

    match domain {
        CUSTODY if entity_type.requires_ubo() => graph.depends(CUSTODY, UBO),
        TRADING | FUND_ACCOUNTING => {
            graph.depends(domain, CUSTODY);
            add_product_rules(graph, CUSTODY, entity_type);
        }
        HEDGE_FUND_INVESTOR | COMPLIANCE => graph.depends(domain, KYC),
        _ => {}
    }
}

fn compliance_tier(jurisdiction: &JurisdictionClass, input: &AnalysisInput<'_>) -> ComplianceTier {
    let high_risk = input
        .risk_profile
        .is_some_and(|risk| risk.eq_ignore_ascii_case("HIGH"));
    if jurisdiction.mandates_enhanced() || high_risk {
        ComplianceTier::Enhanced
    } else {
        input.requested_tier.unwrap_or_default()
    }
}

fn complexity(domains: &[String]) -> Complexity {
    let base = match domains.len() {
        0..=2 => Complexity::Low,
        3..=4 => Complexity::Medium,
        _ => Complexity::High,
    };
    if base == Complexity::Low && domains.iter().any(|d| d == UBO) {
        Complexity::Medium
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(entity: &str, jurisdiction: &str, products: &[&str]) -> ContextAnalysis {
        let products: Vec<String> = products.iter().map(|p| p.to_string()).collect();
        ContextAnalyzer::new()
            .analyze(&AnalysisInput {
                entity_type: entity,
                jurisdiction,
                products: &products,
                ..Default::default()
            })
            .unwrap()
    }

    fn assert_no_dangling(analysis: &ContextAnalysis) {
        for (domain, deps) in &analysis.dependencies {
            assert!(analysis.requires(domain), "{} not required", domain);
            for dep in deps {
                assert!(analysis.requires(dep), "{} -> {} dangles", domain, dep);
            }
        }
    }

    #[test]
    fn test_individual_us_custody() {
        let analysis = analyze("PROPER_PERSON", "US", &["CUSTODY"]);
        assert_eq!(analysis.primary_domain, ONBOARDING);
        assert_eq!(
            analysis.required_domains,
            vec!["custody", "kyc", "onboarding", "us-compliance"]
        );
        assert_eq!(analysis.estimated_complexity, Complexity::Medium);
        assert_eq!(analysis.compliance_tier, ComplianceTier::Enhanced);
        assert!(!analysis.requires(UBO));
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_corporate_multi_product() {
        let analysis = analyze("CORPORATE", "US", &["CUSTODY", "TRADING", "COMPLIANCE"]);
        for domain in [
            "onboarding",
            "kyc",
            "ubo",
            "custody",
            "trading",
            "compliance",
            "us-compliance",
        ] {
            assert!(analysis.requires(domain), "missing {}", domain);
        }
        assert_eq!(analysis.dependencies_of(UBO), ["kyc"]);
        assert_eq!(analysis.dependencies_of(TRADING), ["custody", "onboarding"]);
        assert_eq!(analysis.dependencies_of("us-compliance"), ["kyc", "ubo"]);
        assert_eq!(analysis.estimated_complexity, Complexity::High);
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_trust_in_eu_chains_trust_kyc() {
        let analysis = analyze("TRUST", "lu", &["CUSTODY"]);
        assert!(analysis.requires(TRUST_KYC));
        assert!(analysis.requires("eu-compliance"));
        assert_eq!(analysis.dependencies_of(UBO), ["trust-kyc"]);
        assert_eq!(analysis.dependencies_of(TRUST_KYC), ["kyc"]);
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_individual_hedge_fund_investor() {
        let analysis = analyze("INDIVIDUAL", "", &["HEDGE_FUND_INVESTMENT"]);
        assert_eq!(analysis.primary_domain, HEDGE_FUND_INVESTOR);
        assert_eq!(analysis.required_domains, vec!["hedge-fund-investor", "kyc"]);
        assert_eq!(analysis.estimated_complexity, Complexity::Low);
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_investment_workflow_with_mixed_products() {
        let products = vec!["HEDGE_FUND_INVESTMENT".to_string(), "CUSTODY".to_string()];
        let analysis = ContextAnalyzer::new()
            .analyze(&AnalysisInput {
                entity_type: "INDIVIDUAL",
                jurisdiction: "CH",
                products: &products,
                workflow_type: WorkflowType::Investment,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(analysis.primary_domain, HEDGE_FUND_INVESTOR);
        assert!(!analysis.requires(ONBOARDING));
        assert!(analysis.requires("swiss-compliance"));
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_trading_implies_custody() {
        let analysis = analyze("PARTNERSHIP", "KY", &["TRADING"]);
        assert!(analysis.requires(CUSTODY));
        assert_eq!(analysis.dependencies_of(CUSTODY), ["onboarding", "ubo"]);
        assert_no_dangling(&analysis);
    }

    #[test]
    fn test_rejections() {
        let products = vec!["CUSTODY".to_string()];
        let analyzer = ContextAnalyzer::new();

        assert!(matches!(
            analyzer.analyze(&AnalysisInput {
                entity_type: "FOUNDATION",
                jurisdiction: "US",
                products: &products,
                ..Default::default()
            }),
            Err(AnalysisError::UnsupportedEntityType { .. })
        ));
        assert!(matches!(
            analyzer.analyze(&AnalysisInput {
                entity_type: "CORPORATE",
                jurisdiction: "U5A",
                products: &products,
                ..Default::default()
            }),
            Err(AnalysisError::UnsupportedJurisdiction { .. })
        ));

        let odd = vec!["SPACE_TOURISM".to_string()];
        assert!(matches!(
            analyzer.analyze(&AnalysisInput {
                entity_type: "CORPORATE",
                products: &odd,
                ..Default::default()
            }),
            Err(AnalysisError::UnsupportedProduct { .. })
        ));
    }

    #[test]
    fn test_eu_jurisdictions() {
        for code in ["DE", "fr", "Lu", "IE", "NL"] {
            assert!(is_eu_jurisdiction(code), "{} should be EU", code);
        }
        for code in ["US", "GB", "CH", "KY"] {
            assert!(!is_eu_jurisdiction(code), "{} should not be EU", code);
        }
        assert_eq!(EU_MEMBER_STATES.len(), 27);
    }

    #[test]
    fn test_high_risk_forces_enhanced_tier() {
        let products = vec!["CUSTODY".to_string()];
        let analysis = ContextAnalyzer::new()
            .analyze(&AnalysisInput {
                entity_type: "CORPORATE",
                jurisdiction: "KY",
                products: &products,
                risk_profile: Some("high"),
                requested_tier: Some(ComplianceTier::Simplified),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(analysis.compliance_tier, ComplianceTier::Enhanced);
    }
}
