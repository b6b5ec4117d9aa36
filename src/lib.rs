//! OB Orchestration - cross-domain workflow coordination
//!
//! Coordinates the domain modules of an onboarding case (KYC, UBO, custody,
//! trading, compliance, ...) through one shared session and one growing DSL
//! document.
//!
//! ## Call chain
//! Case description -> Context analysis -> Execution plan (stages) ->
//! Master DSL composition -> Session -> Instructions routed to domains ->
//! Fragments accumulated into the unified DSL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ob_orchestration::{
//!     register_standard_domains, CreateSessionRequest, DomainRegistry, Orchestrator,
//!     OrchestratorConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DomainRegistry::new();
//! register_standard_domains(&registry)?;
//! let orchestrator = Orchestrator::new(Arc::new(registry), OrchestratorConfig::default())?;
//!
//! let session = orchestrator
//!     .create_session(
//!         CreateSessionRequest::new("Acme Holdings", "CORPORATE", "US")
//!             .with_products(["CUSTODY", "TRADING"]),
//!     )
//!     .await?;
//! let result = orchestrator
//!     .execute_instruction(&session.session_id, "verify identity and open a custody account")
//!     .await?;
//! println!("{}", result.unified_dsl);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;
pub mod config;

// DSL text handling
pub mod dsl;

// Domain plugin boundary
pub mod domains;

// Analysis -> plan -> composition
pub mod analysis;
pub mod planner;
pub mod composition;

// Orchestration verbs
pub mod vocabulary;
pub mod attributes;
pub mod compatibility;
pub mod executor;
pub mod routing;

// Sessions and persistence
pub mod session;
pub mod store;

pub mod orchestrator;

pub use dsl_types::{
    ComplianceTier, Complexity, ContextAnalysis, DomainSessionState, EntityType, ExecutionPlan,
    ExecutionStage, SessionState, StageState, StateTransition, WorkflowType,
};

pub use analysis::{AnalysisInput, ContextAnalyzer};
pub use attributes::{ConflictStrategy, CrossDomainAttributeManager, SyncPlan};
pub use compatibility::{CompatibilityRules, CompatibilityTable, PermissiveCompatibility};
pub use composition::{CompositionEngine, CompositionRequest, CompositionResult};
pub use config::OrchestratorConfig;
pub use domains::{
    available_domains, register_standard_domains, DomainContext, DomainError, DomainPlugin,
    DomainRegistry, GenerationResponse, TemplateDomain,
};
pub use error::{OrchestrationError, OrchestrationResult, StoreError};
pub use executor::{OrchestrationProcessingResult, VerbExecutor};
pub use orchestrator::{CreateSessionRequest, InstructionResult, Orchestrator, OrchestratorMetrics};
pub use planner::ExecutionPlanner;
pub use routing::{translate_instruction, DomainRouter};
pub use session::{OrchestrationSession, SessionStatus, SessionSummary, SharedContext};
pub use store::{InMemorySessionStore, JsonFileSessionStore, SessionStore};
pub use vocabulary::{OrchestrationVocabulary, VerbCategory};
