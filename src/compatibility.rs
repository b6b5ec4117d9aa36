//! Product compatibility rules
//!
//! Product/entity/jurisdiction compatibility is an injectable extension
//! point. [`PermissiveCompatibility`] reports everything compatible and says
//! so in a warning; [`CompatibilityTable`] evaluates real rules.

use std::collections::BTreeMap;

use dsl_types::EntityType;
use serde::{Deserialize, Serialize};

/// Compatibility verdict for one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductCompatibility {
    pub product: String,
    pub compatible: bool,
    /// Reasons the product is incompatible
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Verdicts for every requested product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub products: Vec<ProductCompatibility>,
    pub all_compatible: bool,
    pub warnings: Vec<String>,
}

impl CompatibilityReport {
    pub fn incompatible(&self) -> impl Iterator<Item = &ProductCompatibility> {
        self.products.iter().filter(|p| !p.compatible)
    }
}

pub trait CompatibilityRules: Send + Sync {
    fn name(&self) -> &str;

    fn check(
        &self,
        product: &str,
        entity_type: Option<EntityType>,
        jurisdictions: &[String],
    ) -> ProductCompatibility;

    fn evaluate(
        &self,
        products: &[String],
        entity_type: Option<EntityType>,
        jurisdictions: &[String],
    ) -> CompatibilityReport {
        let products: Vec<ProductCompatibility> = products
            .iter()
            .map(|p| self.check(p, entity_type, jurisdictions))
            .collect();
        let warnings = products
            .iter()
            .flat_map(|p| p.warnings.iter().cloned())
            .chain(
                products
                    .iter()
                    .flat_map(|p| p.issues.iter().map(move |i| format!("{}: {}", p.product, i))),
            )
            .collect();
        CompatibilityReport {
            all_compatible: products.iter().all(|p| p.compatible),
            products,
            warnings,
        }
    }
}

/// Treats every product as compatible
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveCompatibility;

impl CompatibilityRules for PermissiveCompatibility {
    fn name(&self) -> &str {
        "permissive"
    }

    fn check(
        &self,
        product: &str,
        _entity_type: Option<EntityType>,
        _jurisdictions: &[String],
    ) -> ProductCompatibility {
        ProductCompatibility {
            product: product.to_string(),
            compatible: true,
            issues: Vec::new(),
            warnings: vec![format!(
                "{}: compatibility not evaluated (permissive rules)",
                product
            )],
        }
    }
}

/// Rules for one product
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRule {
    /// None means every entity type is supported
    pub supported_entities: Option<Vec<EntityType>>,
    /// Supported, but flagged for review
    pub restricted_entities: Vec<EntityType>,
    pub excluded_jurisdictions: Vec<String>,
}

impl ProductRule {
    pub fn all_entities() -> Self {
        Self::default()
    }

    pub fn only(entities: &[EntityType]) -> Self {
        Self {
            supported_entities: Some(entities.to_vec()),
            ..Self::default()
        }
    }

    pub fn restrict(mut self, entity: EntityType) -> Self {
        self.restricted_entities.push(entity);
        self
    }

    pub fn exclude_jurisdictions(mut self, codes: &[&str]) -> Self {
        self.excluded_jurisdictions
            .extend(codes.iter().map(|c| c.to_uppercase()));
        self
    }
}

/// Comprehensively sanctioned jurisdictions excluded from every standard product
const SANCTIONED: &[&str] = &["CU", "IR", "KP", "SY"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityTable {
    rules: BTreeMap<String, ProductRule>,
}

fn product_key(product: &str) -> String {
    product.trim().to_uppercase().replace(['-', ' '], "_")
}

impl CompatibilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, product: &str, rule: ProductRule) -> Self {
        self.rules.insert(product_key(product), rule);
        self
    }

    pub fn standard() -> Self {
        use EntityType::*;
        Self::new()
            .with_rule(
                "CUSTODY",
                ProductRule::all_entities().exclude_jurisdictions(SANCTIONED),
            )
            .with_rule(
                "TRADING",
                ProductRule::all_entities()
                    .restrict(Individual)
                    .exclude_jurisdictions(SANCTIONED),
            )
            .with_rule(
                "FUND_ACCOUNTING",
                ProductRule::only(&[Corporate, Trust, Partnership])
                    .exclude_jurisdictions(SANCTIONED),
            )
            .with_rule(
                "HEDGE_FUND_INVESTMENT",
                ProductRule::all_entities()
                    .restrict(Trust)
                    .exclude_jurisdictions(SANCTIONED),
            )
            .with_rule(
                "COMPLIANCE_REPORTING",
                ProductRule::all_entities().exclude_jurisdictions(SANCTIONED),
            )
    }
}

impl CompatibilityRules for CompatibilityTable {
    fn name(&self) -> &str {
        "table"
    }

    fn check(
        &self,
        product: &str,
        entity_type: Option<EntityType>,
        jurisdictions: &[String],
    ) -> ProductCompatibility {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();

        match self.rules.get(&product_key(product)) {
            None => warnings.push(format!("{}: no compatibility rule defined", product)),
            Some(rule) => {
                if let Some(entity) = entity_type {
                    let supported = rule
                        .supported_entities
                        .as_ref()
                        .is_none_or(|list| list.contains(&entity));
                    if !supported {
                        issues.push(format!("not available to {} entities", entity));
                    } else if rule.restricted_entities.contains(&entity) {
                        warnings.push(format!(
                            "{}: {} entities require additional review",
                            product, entity
                        ));
                    }
                }
                for code in jurisdictions {
                    if rule.excluded_jurisdictions.contains(&code.to_uppercase()) {
                        issues.push(format!("not offered in jurisdiction {}", code.to_uppercase()));
                    }
                }
            }
        }

        ProductCompatibility {
            product: product.to_string(),
            compatible: issues.is_empty(),
            issues,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_permissive_rules_warn() {
        let report = PermissiveCompatibility.evaluate(
            &strings(&["CUSTODY", "TRADING"]),
            Some(EntityType::Individual),
            &[],
        );
        assert!(report.all_compatible);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_table_flags_unsupported_entity() {
        let report = CompatibilityTable::standard().evaluate(
            &strings(&["fund-accounting", "CUSTODY"]),
            Some(EntityType::Individual),
            &strings(&["US"]),
        );
        assert!(!report.all_compatible);
        let bad: Vec<&str> = report.incompatible().map(|p| p.product.as_str()).collect();
        assert_eq!(bad, vec!["fund-accounting"]);
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("not available to INDIVIDUAL")));
    }

    #[test]
    fn test_table_excludes_jurisdictions_and_warns_on_restricted() {
        let table = CompatibilityTable::standard();
        let sanctioned = table.check("CUSTODY", Some(EntityType::Corporate), &strings(&["ir"]));
        assert!(!sanctioned.compatible);

        let restricted = table.check("TRADING", Some(EntityType::Individual), &strings(&["GB"]));
        assert!(restricted.compatible);
        assert_eq!(restricted.warnings.len(), 1);

        let unknown = table.check("SPACE_TOURISM", None, &[]);
        assert!(unknown.compatible);
        assert!(unknown.warnings[0].contains("no compatibility rule"));
    }
}
