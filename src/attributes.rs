//! Cross-Domain Attribute Manager
//!
//! Tracks which domains reference each attribute id and resolves conflicting
//! updates. Registrations are advisory and never removed; they only decide
//! whether synchronisation is needed. Registration is idempotent, so the
//! order in which domains register does not matter.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// How a conflicting update is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[default]
    SourceWins,
    TimestampWins,
    MergeValues,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::SourceWins => "SOURCE_WINS",
            ConflictStrategy::TimestampWins => "TIMESTAMP_WINS",
            ConflictStrategy::MergeValues => "MERGE_VALUES",
        }
    }

    /// Unknown names fall back to SOURCE_WINS
    pub fn parse_or_default(name: &str) -> Self {
        match name.trim().to_uppercase().as_str() {
            "TIMESTAMP_WINS" => ConflictStrategy::TimestampWins,
            "MERGE_VALUES" => ConflictStrategy::MergeValues,
            _ => ConflictStrategy::SourceWins,
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A value together with where and when it was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeValue {
    pub value: String,
    pub source_domain: String,
    pub updated_at: DateTime<Utc>,
}

impl AttributeValue {
    pub fn new(value: impl Into<String>, source_domain: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            source_domain: source_domain.into(),
            updated_at,
        }
    }
}

/// Planned propagation of one attribute update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub attribute_id: String,
    pub source_domain: String,
    /// Domains that receive the resolved value
    pub targets: Vec<String>,
    pub strategy: ConflictStrategy,
    pub resolved: AttributeValue,
}

/// Outcome of a consistency check for one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub attribute_id: String,
    pub domains: Vec<String>,
    pub consistent: bool,
    /// domain -> value it last reported
    pub observed: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossDomainAttributeManager {
    /// attribute id -> domains using it
    references: BTreeMap<String, BTreeSet<String>>,
    /// attribute id -> domain -> last value written by that domain
    observed: BTreeMap<String, BTreeMap<String, String>>,
}

impl CrossDomainAttributeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the domain was newly added
    pub fn register(&mut self, attribute_id: &str, domain: &str) -> bool {
        let added = self
            .references
            .entry(attribute_id.to_string())
            .or_default()
            .insert(domain.to_string());
        if added {
            debug!(attribute_id, domain, "attribute usage registered");
        }
        added
    }

    pub fn register_all<'a>(&mut self, attribute_id: &str, domains: impl IntoIterator<Item = &'a str>) {
        for domain in domains {
            self.register(attribute_id, domain);
        }
    }

    /// Domains referencing an attribute, sorted
    pub fn domains_for(&self, attribute_id: &str) -> Vec<String> {
        self.references
            .get(attribute_id)
            .map(|domains| domains.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attribute_ids(&self) -> Vec<String> {
        self.references.keys().cloned().collect()
    }

    pub fn needs_sync(&self, attribute_id: &str) -> bool {
        self.references
            .get(attribute_id)
            .is_some_and(|domains| domains.len() > 1)
    }

    /// Resolve a conflicting write under `strategy`
    pub fn resolve(
        strategy: ConflictStrategy,
        current: Option<&AttributeValue>,
        incoming: &AttributeValue,
    ) -> AttributeValue {
        let Some(current) = current else {
            return incoming.clone();
        };
        match strategy {
            ConflictStrategy::SourceWins => incoming.clone(),
            ConflictStrategy::TimestampWins => {
                if incoming.updated_at >= current.updated_at {
                    incoming.clone()
                } else {
                    current.clone()
                }
            }
            ConflictStrategy::MergeValues => {
                if current.value == incoming.value {
                    incoming.clone()
                } else {
                    AttributeValue {
                        value: format!("{}; {}", current.value, incoming.value),
                        source_domain: incoming.source_domain.clone(),
                        updated_at: incoming.updated_at.max(current.updated_at),
                    }
                }
            }
        }
    }

    /// Record a write and, when other domains share the attribute, work out
    /// where the resolved value must go. Returns None when no other domain
    /// references the attribute.
    pub fn plan_sync(
        &mut self,
        attribute_id: &str,
        current: Option<&AttributeValue>,
        incoming: &AttributeValue,
        strategy: ConflictStrategy,
    ) -> Option<SyncPlan> {
        self.register(attribute_id, &incoming.source_domain);
        let resolved = Self::resolve(strategy, current, incoming);
        self.observed
            .entry(attribute_id.to_string())
            .or_default()
            .insert(incoming.source_domain.clone(), resolved.value.clone());

        if !self.needs_sync(attribute_id) {
            return None;
        }

        let targets: Vec<String> = self
            .domains_for(attribute_id)
            .into_iter()
            .filter(|d| *d != incoming.source_domain)
            .collect();
        if let Some(seen) = self.observed.get_mut(attribute_id) {
            for target in &targets {
                seen.insert(target.clone(), resolved.value.clone());
            }
        }

        debug!(
            attribute_id,
            source = %incoming.source_domain,
            targets = targets.len(),
            strategy = %strategy,
            "attribute sync planned"
        );

        Some(SyncPlan {
            attribute_id: attribute_id.to_string(),
            source_domain: incoming.source_domain.clone(),
            targets,
            strategy,
            resolved,
        })
    }

    /// Record the value a domain reports for an attribute without
    /// propagating it
    pub fn observe(&mut self, attribute_id: &str, domain: &str, value: impl Into<String>) {
        self.register(attribute_id, domain);
        self.observed
            .entry(attribute_id.to_string())
            .or_default()
            .insert(domain.to_string(), value.into());
    }

    /// Consistent when every domain that has reported a value reported the
    /// same one. Domains with nothing reported do not count against it.
    pub fn validate_consistency(&self, attribute_id: &str) -> ConsistencyReport {
        let domains = self.domains_for(attribute_id);
        let observed: BTreeMap<String, String> = self
            .observed
            .get(attribute_id)
            .map(|values| {
                values
                    .iter()
                    .filter(|(domain, _)| domains.contains(domain))
                    .map(|(d, v)| (d.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let distinct: BTreeSet<&String> = observed.values().collect();

        ConsistencyReport {
            attribute_id: attribute_id.to_string(),
            consistent: distinct.len() <= 1,
            domains,
            observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn value(v: &str, domain: &str, offset_secs: i64) -> AttributeValue {
        let base = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        AttributeValue::new(v, domain, base + Duration::seconds(offset_secs))
    }

    #[test]
    fn test_registration_is_idempotent_and_commutative() {
        let mut a = CrossDomainAttributeManager::new();
        assert!(a.register("entity.legal_name", "kyc"));
        assert!(!a.register("entity.legal_name", "kyc"));
        a.register("entity.legal_name", "ubo");

        let mut b = CrossDomainAttributeManager::new();
        b.register("entity.legal_name", "ubo");
        b.register("entity.legal_name", "kyc");

        assert_eq!(a, b);
        assert_eq!(a.domains_for("entity.legal_name"), vec!["kyc", "ubo"]);
        assert!(a.needs_sync("entity.legal_name"));
        assert!(!a.needs_sync("unknown"));
    }

    #[test]
    fn test_single_domain_needs_no_sync() {
        let mut manager = CrossDomainAttributeManager::new();
        let plan = manager.plan_sync(
            "entity.address",
            None,
            &value("1 Main St", "kyc", 0),
            ConflictStrategy::SourceWins,
        );
        assert!(plan.is_none());
        assert_eq!(manager.domains_for("entity.address"), vec!["kyc"]);
    }

    #[test]
    fn test_conflict_strategies() {
        let old = value("A", "kyc", 10);
        let newer = value("B", "ubo", 20);
        let stale = value("C", "ubo", 5);

        assert_eq!(
            CrossDomainAttributeManager::resolve(ConflictStrategy::SourceWins, Some(&old), &stale).value,
            "C"
        );
        assert_eq!(
            CrossDomainAttributeManager::resolve(ConflictStrategy::TimestampWins, Some(&old), &stale).value,
            "A"
        );
        assert_eq!(
            CrossDomainAttributeManager::resolve(ConflictStrategy::TimestampWins, Some(&old), &newer).value,
            "B"
        );
        assert_eq!(
            CrossDomainAttributeManager::resolve(ConflictStrategy::MergeValues, Some(&old), &newer).value,
            "A; B"
        );
        assert_eq!(ConflictStrategy::parse_or_default("bogus"), ConflictStrategy::SourceWins);
    }

    #[test]
    fn test_sync_plan_targets_other_domains() {
        let mut manager = CrossDomainAttributeManager::new();
        manager.register_all("entity.address", ["kyc", "custody", "ubo"]);

        let plan = manager
            .plan_sync(
                "entity.address",
                None,
                &value("2 High St", "kyc", 0),
                ConflictStrategy::SourceWins,
            )
            .unwrap();
        assert_eq!(plan.targets, vec!["custody", "ubo"]);
        assert!(manager.validate_consistency("entity.address").consistent);

        manager.observe("entity.address", "custody", "99 Other Rd");
        let report = manager.validate_consistency("entity.address");
        assert!(!report.consistent);
        assert_eq!(report.observed["custody"], "99 Other Rd");
    }
}
