//! Domain Plugin Boundary
//!
//! Domains (KYC, UBO, custody, trading, compliance, ...) are independently
//! versioned workflow modules. The orchestrator only ever sees them through
//! the [`DomainPlugin`] trait: it asks a domain for its vocabulary, its
//! health and a DSL fragment for an instruction, and treats the returned
//! fragment as opaque text.
//!
//! ## Domain Structure:
//! - Each domain implements the `DomainPlugin` trait
//! - Domains are registered once in a [`DomainRegistry`] before traffic starts
//! - [`TemplateDomain`] is a keyword/template plugin used for the standard
//!   domain set, demos and tests
//!
//! ## Available Domains:
//! See [`available_domains`] for the standard set registered by
//! [`register_standard_domains`].

pub mod context;
pub mod registry;
pub mod template;

pub use context::DomainContext;
pub use registry::DomainRegistry;
pub use template::TemplateDomain;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dsl::parse_document;

/// Verbs, categories and states a domain understands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainVocabulary {
    pub verbs: Vec<String>,
    pub categories: Vec<String>,
    pub states: Vec<String>,
}

impl DomainVocabulary {
    pub fn has_verb(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// A domain's answer to a generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub fragment: String,
    pub matched_verb: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub is_valid: bool,
    pub confidence: f64,
    pub explanation: String,
}

impl GenerationResponse {
    pub fn new(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            matched_verb: None,
            parameters: BTreeMap::new(),
            is_valid: true,
            confidence: 1.0,
            explanation: String::new(),
        }
    }
}

/// Interface every domain exposes to the orchestrator
#[async_trait]
pub trait DomainPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn vocabulary(&self) -> &DomainVocabulary;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Produce a DSL fragment for `instruction`; may be slow
    async fn generate_dsl(
        &self,
        instruction: &str,
        context: &DomainContext,
    ) -> Result<GenerationResponse, DomainError>;

    /// Reject fragments that use verbs outside this domain's vocabulary
    fn validate_verbs(&self, dsl: &str) -> Result<(), DomainError> {
        let forms = parse_document(dsl).map_err(|e| DomainError::InvalidVerbs {
            domain: self.name().to_string(),
            message: e.to_string(),
        })?;

        let unknown: Vec<String> = forms
            .iter()
            .filter_map(|form| form.expr.head())
            .filter(|verb| !self.vocabulary().has_verb(verb))
            .map(|verb| verb.to_string())
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(DomainError::InvalidVerbs {
                domain: self.name().to_string(),
                message: format!("unknown verbs: {}", unknown.join(", ")),
            })
        }
    }

    fn valid_states(&self) -> Vec<String> {
        self.vocabulary().states.clone()
    }

    fn initial_state(&self) -> String {
        self.vocabulary()
            .states
            .first()
            .cloned()
            .unwrap_or_else(|| "CREATED".to_string())
    }
}

/// Domain-specific error types that can occur during domain operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("Domain '{domain}' not registered")]
    NotRegistered { domain: String },

    #[error("Domain '{domain}' already registered")]
    AlreadyRegistered { domain: String },

    #[error("Domain '{domain}' is unhealthy")]
    Unhealthy { domain: String },

    #[error("Generation failed in domain '{domain}': {message}")]
    GenerationFailed { domain: String, message: String },

    #[error("Invalid verbs in domain '{domain}': {message}")]
    InvalidVerbs { domain: String, message: String },

    #[error("Domain '{domain}' did not respond within {seconds}s")]
    Timeout { domain: String, seconds: u64 },
}

/// Get list of all standard domain names
pub fn available_domains() -> Vec<&'static str> {
    template::STANDARD_DOMAINS
        .iter()
        .map(|definition| definition.name)
        .collect()
}

/// Register all standard template domains with the registry
pub fn register_standard_domains(registry: &DomainRegistry) -> Result<(), DomainError> {
    for definition in template::STANDARD_DOMAINS {
        registry.register(Arc::new(TemplateDomain::from_definition(definition)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_domains_register_once() {
        let registry = DomainRegistry::new();
        register_standard_domains(&registry).unwrap();
        assert_eq!(registry.len(), available_domains().len());

        let again = register_standard_domains(&registry);
        assert!(matches!(again, Err(DomainError::AlreadyRegistered { .. })));
    }

    #[test]
    fn test_default_verb_validation() {
        let registry = DomainRegistry::new();
        register_standard_domains(&registry).unwrap();
        let kyc = registry.get("kyc").unwrap();

        assert!(kyc.validate_verbs("(kyc.start (entity.name \"A\"))").is_ok());
        let err = kyc.validate_verbs("(custody.open.account)").unwrap_err();
        assert!(err.to_string().contains("custody.open.account"));
        assert_eq!(kyc.initial_state(), "CREATED");
    }
}
