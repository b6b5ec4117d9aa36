//! DSL Template Engine
//!
//! Pre-defined component templates for master DSL composition. Templates use
//! `{{name}}` placeholders; text values are quoted and escaped when set, so a
//! rendered template is always a well-formed document for well-formed input.

use std::collections::BTreeMap;

use dsl_types::{ComplianceTier, EntityType};

use crate::analysis::{COMPLIANCE, CUSTODY, FUND_ACCOUNTING, HEDGE_FUND_INVESTOR, TRADING};
use crate::dsl::quote;
use crate::error::CompositionError;

pub const INDIVIDUAL_WORKFLOW: &str = "individual_workflow";
pub const CORPORATE_UBO_WORKFLOW: &str = "corporate_ubo_workflow";
pub const CORPORATE_BASIC_WORKFLOW: &str = "corporate_basic_workflow";
pub const TRUST_UBO_WORKFLOW: &str = "trust_ubo_workflow";
pub const PARTNERSHIP_UBO_WORKFLOW: &str = "partnership_ubo_workflow";

pub const CUSTODY_REQUIREMENTS: &str = "custody_requirements";
pub const TRADING_REQUIREMENTS: &str = "trading_requirements";
pub const FUND_ACCOUNTING_REQUIREMENTS: &str = "fund_accounting_requirements";
pub const HEDGE_FUND_REQUIREMENTS: &str = "hedge_fund_requirements";
pub const COMPLIANCE_REQUIREMENTS: &str = "compliance_requirements";

pub const FINCEN_CONTROL_PRONG: &str = "fincen_control_prong";
pub const FINCEN_OWNERSHIP_PRONG: &str = "fincen_ownership_prong";
pub const EU_5MLD_DUAL_PRONG: &str = "eu_5mld_dual_prong";
pub const UK_PSC_REGISTER: &str = "uk_psc_register";
pub const SWISS_VSB_DILIGENCE: &str = "swiss_vsb_diligence";
pub const ENHANCED_DUE_DILIGENCE: &str = "enhanced_due_diligence";

/// Every template id the engine knows
pub const TEMPLATE_IDS: &[&str] = &[
    INDIVIDUAL_WORKFLOW,
    CORPORATE_UBO_WORKFLOW,
    CORPORATE_BASIC_WORKFLOW,
    TRUST_UBO_WORKFLOW,
    PARTNERSHIP_UBO_WORKFLOW,
    CUSTODY_REQUIREMENTS,
    TRADING_REQUIREMENTS,
    FUND_ACCOUNTING_REQUIREMENTS,
    HEDGE_FUND_REQUIREMENTS,
    COMPLIANCE_REQUIREMENTS,
    FINCEN_CONTROL_PRONG,
    FINCEN_OWNERSHIP_PRONG,
    EU_5MLD_DUAL_PRONG,
    UK_PSC_REGISTER,
    SWISS_VSB_DILIGENCE,
    ENHANCED_DUE_DILIGENCE,
];

/// Template with `{{variable}}` placeholders
#[derive(Debug, Clone)]
pub struct DslTemplate {
    id: String,
    template: String,
    variables: BTreeMap<String, String>,
}

impl DslTemplate {
    pub fn new(id: &str, template: &str) -> Self {
        Self {
            id: id.to_string(),
            template: template.trim().to_string(),
            variables: BTreeMap::new(),
        }
    }

    /// Look up a pre-defined template
    pub fn named(id: &str) -> Result<Self, CompositionError> {
        let body = template_body(id).ok_or_else(|| CompositionError::UnknownTemplate {
            template: id.to_string(),
        })?;
        Ok(Self::new(id, body))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set a quoted text variable
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.variables.insert(key.to_string(), quote(value));
        self
    }

    /// Set a variable verbatim (numbers, booleans, pre-rendered lists)
    pub fn set_raw(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.variables.insert(key.to_string(), value.into());
        self
    }

    /// Render with variables substituted
    pub fn render(&self) -> String {
        let mut result = self.template.clone();
        for (key, value) in &self.variables {
            let placeholder = format!("{{{{{}}}}}", key);
            result = result.replace(&placeholder, value);
        }
        result
    }

    /// Placeholders still present after substitution
    pub fn unresolved(&self) -> Vec<String> {
        let rendered = self.render();
        let mut names = Vec::new();
        let mut rest = rendered.as_str();
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    names.push(after[..end].to_string());
                    rest = &after[end + 2..];
                }
                None => break,
            }
        }
        names
    }
}

/// Values available to every component template
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub session_id: String,
    pub cbu_id: String,
    pub entity_name: String,
    pub entity_type: String,
    pub jurisdiction: String,
    pub products: Vec<String>,
    pub compliance_tier: ComplianceTier,
}

impl TemplateContext {
    /// Render a named template against this context
    pub fn render(&self, template_id: &str) -> Result<String, CompositionError> {
        let mut template = DslTemplate::named(template_id)?;
        let products: Vec<String> = self.products.iter().map(|p| quote(p)).collect();
        template
            .set("session_id", &self.session_id)
            .set("cbu_id", &self.cbu_id)
            .set("entity_name", &self.entity_name)
            .set("entity_type", &self.entity_type)
            .set("jurisdiction", &self.jurisdiction)
            .set("tier", self.compliance_tier.as_str())
            .set_raw("products", products.join(" "));
        Ok(template.render())
    }
}

/// Entity workflow template for an entity type and tier
pub fn entity_template(entity_type: EntityType, tier: ComplianceTier) -> &'static str {
    match entity_type {
        EntityType::Individual => INDIVIDUAL_WORKFLOW,
        EntityType::Corporate if tier == ComplianceTier::Simplified => CORPORATE_BASIC_WORKFLOW,
        EntityType::Corporate => CORPORATE_UBO_WORKFLOW,
        EntityType::Trust => TRUST_UBO_WORKFLOW,
        EntityType::Partnership => PARTNERSHIP_UBO_WORKFLOW,
    }
}

/// Requirements template for a product domain
pub fn product_template(domain: &str) -> Result<&'static str, CompositionError> {
    let template = match domain {
        CUSTODY => CUSTODY_REQUIREMENTS,
        TRADING => TRADING_REQUIREMENTS,
        FUND_ACCOUNTING => FUND_ACCOUNTING_REQUIREMENTS,
        HEDGE_FUND_INVESTOR => HEDGE_FUND_REQUIREMENTS,
        COMPLIANCE => COMPLIANCE_REQUIREMENTS,
        other => {
            return Err(CompositionError::UnknownTemplate {
                template: format!("{}_requirements", other.replace('-', "_")),
            })
        }
    };
    Ok(template)
}

// ============================================================================
// TEMPLATE BODIES
// ============================================================================

fn template_body(id: &str) -> Option<&'static str> {
    let body = match id {
        INDIVIDUAL_WORKFLOW => {
            r#"
(entity.register
  (entity.name {{entity_name}})
  (entity.type {{entity_type}})
  (cbu.id {{cbu_id}}))
(kyc.collect.document
  (document.type "PASSPORT")
  (document.type "PROOF_OF_ADDRESS"))
(kyc.verify.identity
  (method "DOCUMENTARY")
  (tier {{tier}}))"#
        }
        CORPORATE_UBO_WORKFLOW => {
            r#"
(entity.register
  (entity.name {{entity_name}})
  (entity.type {{entity_type}})
  (cbu.id {{cbu_id}}))
(kyc.collect.document
  (document.type "CERTIFICATE_OF_INCORPORATION")
  (document.type "REGISTER_OF_DIRECTORS")
  (document.type "SHAREHOLDER_REGISTER"))
(ubo.discover.owners
  (entity.name {{entity_name}})
  (ownership.threshold 25.0)
  (include.control.persons true))"#
        }
        CORPORATE_BASIC_WORKFLOW => {
            r#"
(entity.register
  (entity.name {{entity_name}})
  (entity.type {{entity_type}})
  (cbu.id {{cbu_id}}))
(kyc.collect.document
  (document.type "CERTIFICATE_OF_INCORPORATION"))"#
        }
        TRUST_UBO_WORKFLOW => {
            r#"
(entity.register
  (entity.name {{entity_name}})
  (entity.type {{entity_type}})
  (cbu.id {{cbu_id}}))
(trust.identify.parties
  (role "SETTLOR")
  (role "TRUSTEE")
  (role "PROTECTOR")
  (role "BENEFICIARY"))
(ubo.discover.owners
  (entity.name {{entity_name}})
  (ownership.threshold 25.0)
  (look.through.trust true))"#
        }
        PARTNERSHIP_UBO_WORKFLOW => {
            r#"
(entity.register
  (entity.name {{entity_name}})
  (entity.type {{entity_type}})
  (cbu.id {{cbu_id}}))
(partnership.identify.partners
  (role "GENERAL_PARTNER")
  (role "LIMITED_PARTNER"))
(ubo.discover.owners
  (entity.name {{entity_name}})
  (ownership.threshold 25.0)
  (include.general.partners true))"#
        }
        CUSTODY_REQUIREMENTS => {
            r#"
(custody.open.account
  (cbu.id {{cbu_id}})
  (account.type "SAFEKEEPING")
  (jurisdiction {{jurisdiction}}))
(custody.configure.settlement
  (settlement.instructions "STANDARD"))"#
        }
        TRADING_REQUIREMENTS => {
            r#"
(trading.enable.account
  (cbu.id {{cbu_id}})
  (requires.custody true))
(trading.configure.limits
  (limit.profile {{tier}}))"#
        }
        FUND_ACCOUNTING_REQUIREMENTS => {
            r#"
(fund-accounting.setup.ledger
  (cbu.id {{cbu_id}})
  (valuation.frequency "DAILY"))"#
        }
        HEDGE_FUND_REQUIREMENTS => {
            r#"
(investor.record.subscription
  (investor.name {{entity_name}})
  (investor.type {{entity_type}})
  (products {{products}}))
(investor.check.eligibility
  (jurisdiction {{jurisdiction}})
  (accredited.required true))"#
        }
        COMPLIANCE_REQUIREMENTS => {
            r#"
(compliance.screen.sanctions
  (entity.name {{entity_name}})
  (lists "OFAC" "EU" "UN"))
(compliance.schedule.reporting
  (cbu.id {{cbu_id}})
  (frequency "QUARTERLY"))"#
        }
        FINCEN_CONTROL_PRONG => {
            r#"
(compliance.fincen.control.prong
  (entity.name {{entity_name}})
  (identify.senior.manager true)
  (jurisdiction {{jurisdiction}}))"#
        }
        FINCEN_OWNERSHIP_PRONG => {
            r#"
(compliance.fincen.ownership.prong
  (entity.name {{entity_name}})
  (ownership.threshold 25.0)
  (jurisdiction {{jurisdiction}}))"#
        }
        EU_5MLD_DUAL_PRONG => {
            r#"
(compliance.eu.5mld.verify
  (entity.name {{entity_name}})
  (ownership.threshold 25.0)
  (control.assessment true)
  (central.register.check true)
  (jurisdiction {{jurisdiction}}))"#
        }
        UK_PSC_REGISTER => {
            r#"
(compliance.uk.psc.verify
  (entity.name {{entity_name}})
  (register "COMPANIES_HOUSE")
  (significant.control.threshold 25.0))"#
        }
        SWISS_VSB_DILIGENCE => {
            r#"
(compliance.swiss.vsb.verify
  (entity.name {{entity_name}})
  (form "FORM_A")
  (beneficial.owner.declaration true))"#
        }
        ENHANCED_DUE_DILIGENCE => {
            r#"
(kyc.enhanced.due.diligence
  (entity.name {{entity_name}})
  (tier {{tier}})
  (source.of.wealth true)
  (senior.approval true)
  (review.frequency "ANNUAL"))"#
        }
        _ => return None,
    };
    Some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::check_balance;

    fn context() -> TemplateContext {
        TemplateContext {
            session_id: "sess-1".to_string(),
            cbu_id: "CBU-001".to_string(),
            entity_name: "Acme \"Holdings\" Ltd".to_string(),
            entity_type: "CORPORATE".to_string(),
            jurisdiction: "US".to_string(),
            products: vec!["CUSTODY".to_string(), "TRADING".to_string()],
            compliance_tier: ComplianceTier::Enhanced,
        }
    }

    #[test]
    fn test_template_rendering() {
        let mut template = DslTemplate::new("t", "(cbu.create (name {{name}}) (n {{n}}))");
        template.set("name", "TechCorp").set_raw("n", "3");
        assert_eq!(template.render(), "(cbu.create (name \"TechCorp\") (n 3))");
        assert!(template.unresolved().is_empty());
    }

    #[test]
    fn test_unresolved_placeholders_are_reported() {
        let template = DslTemplate::new("t", "(a {{x}} {{y}})");
        assert_eq!(template.unresolved(), vec!["x", "y"]);
    }

    #[test]
    fn test_every_template_renders_balanced_and_complete() {
        let ctx = context();
        for id in TEMPLATE_IDS {
            let rendered = ctx.render(id).unwrap();
            assert!(!rendered.contains("{{"), "{} left placeholders", id);
            assert!(check_balance(&rendered).is_ok(), "{} unbalanced", id);
            assert!(crate::dsl::parse_document(&rendered).is_ok(), "{} unparsable", id);
        }
    }

    #[test]
    fn test_unknown_template_is_an_error() {
        assert_eq!(
            DslTemplate::named("generic_product_requirements").unwrap_err(),
            CompositionError::UnknownTemplate {
                template: "generic_product_requirements".to_string()
            }
        );
        assert!(product_template("ubo").is_err());
    }

    #[test]
    fn test_entity_template_selection() {
        assert_eq!(
            entity_template(EntityType::Corporate, ComplianceTier::Standard),
            CORPORATE_UBO_WORKFLOW
        );
        assert_eq!(
            entity_template(EntityType::Corporate, ComplianceTier::Simplified),
            CORPORATE_BASIC_WORKFLOW
        );
        assert_eq!(
            entity_template(EntityType::Individual, ComplianceTier::Enhanced),
            INDIVIDUAL_WORKFLOW
        );
    }
}
