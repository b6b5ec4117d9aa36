//! Error handling for the orchestration engine
//!
//! Errors are grouped by the layer that detects them and aggregated in
//! [`OrchestrationError`]. The classifiers on the aggregate map every error
//! onto the validation / structural / capacity taxonomy so a transport layer
//! can choose a status code without matching on individual variants.

use dsl_types::SourceLocation;
use thiserror::Error;

use crate::domains::DomainError;

/// Main error type for the orchestration engine
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Composition error: {0}")]
    Composition(#[from] CompositionError),

    #[error("Verb error: {0}")]
    Verb(#[from] VerbError),

    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("maximum concurrent sessions ({limit}) reached")]
    CapacityExceeded { limit: usize },

    #[error("session {session_id} not found")]
    SessionNotFound { session_id: String },

    #[error("session {session_id} already exists")]
    SessionAlreadyExists { session_id: String },

    #[error("invalid state transition for session {session_id}: {from} -> {to}")]
    InvalidTransition {
        session_id: String,
        from: String,
        to: String,
    },

    #[error("domain '{domain}' is not part of session {session_id}")]
    DomainNotInSession { session_id: String, domain: String },

    #[error("instruction not understood: {0}")]
    InstructionNotUnderstood(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OrchestrationError {
    /// Caller supplied something the engine cannot accept
    pub fn is_validation(&self) -> bool {
        match self {
            OrchestrationError::Analysis(_)
            | OrchestrationError::Verb(_)
            | OrchestrationError::DomainNotInSession { .. }
            | OrchestrationError::InstructionNotUnderstood(_)
            | OrchestrationError::InvalidTransition { .. }
            | OrchestrationError::SessionAlreadyExists { .. }
            | OrchestrationError::Config(_) => true,
            OrchestrationError::Plan(err) => matches!(err, PlanError::UnknownDependency { .. }),
            OrchestrationError::Composition(err) => matches!(
                err,
                CompositionError::UnknownTemplate { .. } | CompositionError::Analysis(_)
            ),
            _ => false,
        }
    }

    /// Graph or document shape is broken
    pub fn is_structural(&self) -> bool {
        match self {
            OrchestrationError::Parse(_) => true,
            OrchestrationError::Plan(err) => !matches!(err, PlanError::UnknownDependency { .. }),
            OrchestrationError::Composition(err) => matches!(
                err,
                CompositionError::EmptyOutput | CompositionError::Plan(_)
            ),
            _ => false,
        }
    }

    /// Retryable once capacity or session availability changes
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            OrchestrationError::CapacityExceeded { .. }
                | OrchestrationError::SessionNotFound { .. }
        )
    }
}

/// Result type for orchestration operations
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

/// Context analysis rejected the case description
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("unsupported entity type '{entity_type}'")]
    UnsupportedEntityType { entity_type: String },

    #[error("unsupported jurisdiction '{jurisdiction}'")]
    UnsupportedJurisdiction { jurisdiction: String },

    #[error("unsupported product '{product}'")]
    UnsupportedProduct { product: String },
}

/// Execution planning failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("circular dependency detected in domains: {domains}")]
    CircularDependency { domains: String },

    #[error("domain '{domain}' depends on '{dependency}' which is not a required domain")]
    UnknownDependency { domain: String, dependency: String },

    #[error("dependency chain depth {depth} exceeds the configured maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("no domains to plan")]
    EmptyDomainSet,
}

/// DSL composition failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompositionError {
    #[error("unknown template '{template}'")]
    UnknownTemplate { template: String },

    #[error("composed DSL is empty")]
    EmptyOutput,

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Orchestration verb failures; a failing verb leaves the session untouched
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerbError {
    #[error("line {line}: unknown orchestration verb '{verb}'")]
    UnknownVerb { verb: String, line: usize },

    #[error("unknown orchestration verbs: {}", .0.join("; "))]
    UnknownVerbs(Vec<String>),

    #[error("{verb}: missing required parameters: {missing}")]
    MissingParameters { verb: String, missing: String },

    #[error("domain {domain} is not registered")]
    DomainNotRegistered { domain: String },

    #[error("target domain {domain} not found")]
    TargetDomainNotFound { domain: String },

    #[error("{verb}: invalid parameter '{parameter}': {reason}")]
    InvalidParameter {
        verb: String,
        parameter: String,
        reason: String,
    },

    #[error("{verb}: consistency check failed for {attributes}")]
    ConsistencyViolation { verb: String, attributes: String },

    #[error("line {line}: expected a verb form, found {found}")]
    NotAVerbForm { line: usize, found: String },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Persistent store failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("stored session {session_id} not found")]
    NotFound { session_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors from the nom-based S-expression reader
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Syntax error at {location}: {message}")]
    Syntax {
        location: SourceLocation,
        message: String,
    },

    #[error("Unbalanced grouping: {message}")]
    Unbalanced { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        let capacity = OrchestrationError::CapacityExceeded { limit: 2 };
        assert!(capacity.is_capacity());
        assert_eq!(capacity.to_string(), "maximum concurrent sessions (2) reached");

        let cycle: OrchestrationError = PlanError::CircularDependency {
            domains: "a, b".to_string(),
        }
        .into();
        assert!(cycle.is_structural());
        assert!(!cycle.is_validation());

        let missing: OrchestrationError = VerbError::MissingParameters {
            verb: "orchestration.initialize".to_string(),
            missing: "cbu.id, products".to_string(),
        }
        .into();
        assert!(missing.is_validation());
        assert!(missing
            .to_string()
            .contains("missing required parameters: cbu.id, products"));
    }
}
