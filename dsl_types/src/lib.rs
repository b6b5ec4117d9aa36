//! Orchestration Types - Level 1 Foundation Types
//!
//! This crate contains the pure data structures shared by the orchestration
//! engine: lifecycle states, execution plans, context analysis results and
//! structural validation records.
//!
//! ## Architecture Level: LEVEL 1 (Foundation)
//!
//! Everything in the engine depends on this crate; this crate depends on no
//! other workspace crate.
//!
//! ## Contents
//!
//! - Source location tracking
//! - Session, domain and stage lifecycle states
//! - Entity, workflow, tier and complexity classifications
//! - Context analysis and execution plan records
//! - State transition history entries
//! - Component validation results
//!
//! ## Critical Rules
//!
//! 1. **NO BUSINESS LOGIC** - Only data structures
//! 2. **NO FUNCTIONS** - Except basic constructors, accessors and code mapping
//! 3. **NO WORKSPACE DEPENDENCIES** - Cannot depend on other workspace crates
//! 4. **SERIALIZABLE** - All types must support serde
//! 5. **THREAD SAFE** - All types are Send + Sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// SOURCE LOCATION AND POSITIONING
// ============================================================================

/// Source location in DSL content for error reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Line number (1-based)
    pub line: usize,
    /// Column number (1-based)
    pub column: usize,
    /// Character offset from start of input
    pub offset: usize,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }

    /// Compute the location of a byte offset within `input`
    pub fn from_offset(input: &str, offset: usize) -> Self {
        let offset = offset.min(input.len());
        let consumed = &input[..offset];
        let line = consumed.matches('\n').count() + 1;
        let column = match consumed.rfind('\n') {
            Some(newline) => consumed[newline + 1..].chars().count() + 1,
            None => consumed.chars().count() + 1,
        };
        Self::new(line, column, offset)
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

// ============================================================================
// LIFECYCLE STATES
// ============================================================================

/// Lifecycle state of an orchestration session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "CREATED",
            SessionState::Active => "ACTIVE",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::Expired => "EXPIRED",
        }
    }

    /// Terminal sessions accept no further work
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Expired
        )
    }

    /// Whether the lifecycle permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (_, Expired) => !matches!(self, Expired),
            (Created, Active) => true,
            (Active, Completed) => true,
            (Created | Active, Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of one domain's sub-session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DomainSessionState {
    Created,
    Running,
    Completed,
    Failed,
}

impl DomainSessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainSessionState::Created => "CREATED",
            DomainSessionState::Running => "RUNNING",
            DomainSessionState::Completed => "COMPLETED",
            DomainSessionState::Failed => "FAILED",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DomainSessionState::Completed | DomainSessionState::Failed
        )
    }
}

impl std::fmt::Display for DomainSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// State of an execution stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageState::Pending => "PENDING",
            StageState::Running => "RUNNING",
            StageState::Completed => "COMPLETED",
            StageState::Failed => "FAILED",
            StageState::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a session's append-only state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// `None` for the creation entry
    pub from_state: Option<SessionState>,
    pub to_state: SessionState,
    /// Domain that triggered the transition, if any
    pub domain: Option<String>,
    pub reason: String,
    /// Actor that generated the transition (orchestrator, verb name, sweep)
    pub generated_by: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// CLASSIFICATIONS
// ============================================================================

/// Closed set of supported entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Individual,
    Corporate,
    Trust,
    Partnership,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Individual => "INDIVIDUAL",
            EntityType::Corporate => "CORPORATE",
            EntityType::Trust => "TRUST",
            EntityType::Partnership => "PARTNERSHIP",
        }
    }

    /// Map an external entity type code, including legacy aliases
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_uppercase().replace([' ', '-'], "_").as_str() {
            "INDIVIDUAL" | "PROPER_PERSON" | "NATURAL_PERSON" | "PERSON" => {
                Some(EntityType::Individual)
            }
            "CORPORATE" | "COMPANY" | "CORPORATION" => Some(EntityType::Corporate),
            "TRUST" => Some(EntityType::Trust),
            "PARTNERSHIP" | "LP" | "LLP" => Some(EntityType::Partnership),
            _ => None,
        }
    }

    /// Individuals are exempt from beneficial-ownership discovery
    pub fn requires_ubo(&self) -> bool {
        !matches!(self, EntityType::Individual)
    }

    pub fn all() -> Vec<Self> {
        vec![
            Self::Individual,
            Self::Corporate,
            Self::Trust,
            Self::Partnership,
        ]
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Workflow flavour requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowType {
    #[default]
    Onboarding,
    Investment,
    KycRefresh,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Onboarding => "ONBOARDING",
            WorkflowType::Investment => "INVESTMENT",
            WorkflowType::KycRefresh => "KYC_REFRESH",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "ONBOARDING" => Ok(WorkflowType::Onboarding),
            "INVESTMENT" => Ok(WorkflowType::Investment),
            "KYC_REFRESH" => Ok(WorkflowType::KycRefresh),
            _ => Err(format!("Unknown workflow type: {}", s)),
        }
    }
}

/// Due-diligence tier applied to a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplianceTier {
    Simplified,
    #[default]
    Standard,
    Enhanced,
}

impl ComplianceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceTier::Simplified => "SIMPLIFIED",
            ComplianceTier::Standard => "STANDARD",
            ComplianceTier::Enhanced => "ENHANCED",
        }
    }
}

impl std::fmt::Display for ComplianceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ComplianceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SIMPLIFIED" => Ok(ComplianceTier::Simplified),
            "STANDARD" => Ok(ComplianceTier::Standard),
            "ENHANCED" => Ok(ComplianceTier::Enhanced),
            _ => Err(format!("Unknown compliance tier: {}", s)),
        }
    }
}

/// Coarse complexity rating of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Low => "LOW",
            Complexity::Medium => "MEDIUM",
            Complexity::High => "HIGH",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ANALYSIS AND PLANNING RECORDS
// ============================================================================

/// Output of context analysis for one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextAnalysis {
    pub primary_domain: String,
    /// Deduplicated and sorted
    pub required_domains: Vec<String>,
    /// domain -> domains it depends on (sorted)
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub estimated_complexity: Complexity,
    pub entity_type: EntityType,
    pub compliance_tier: ComplianceTier,
    pub products: Vec<String>,
}

impl ContextAnalysis {
    pub fn requires(&self, domain: &str) -> bool {
        self.required_domains.iter().any(|d| d == domain)
    }

    pub fn dependencies_of(&self, domain: &str) -> &[String] {
        self.dependencies
            .get(domain)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }
}

/// One topological layer of the execution plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStage {
    /// 1-based position in the plan
    pub number: usize,
    /// `stage_N`
    pub name: String,
    pub domains: Vec<String>,
    /// Domains from earlier stages this stage waits on
    pub dependencies: Vec<String>,
    pub required_inputs: Vec<String>,
    pub produced_outputs: Vec<String>,
    pub parallel: bool,
    pub estimated_duration_ms: u64,
    pub state: StageState,
}

impl ExecutionStage {
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d == domain)
    }
}

/// Ordered stages computed from a dependency map
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<ExecutionStage>,
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Domain sets of every parallel-eligible stage
    pub parallel_groups: Vec<Vec<String>>,
    /// Names of the single-domain stages
    pub critical_path: Vec<String>,
    pub estimated_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionPlan {
    /// 1-based stage number holding `domain`
    pub fn stage_of(&self, domain: &str) -> Option<usize> {
        self.stages
            .iter()
            .find(|stage| stage.contains(domain))
            .map(|stage| stage.number)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.stage_of(domain).is_some()
    }

    /// All planned domains in stage order
    pub fn domains(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|stage| stage.domains.iter().cloned())
            .collect()
    }

    pub fn total_stages(&self) -> usize {
        self.stages.len()
    }
}

// ============================================================================
// VALIDATION STRUCTURES
// ============================================================================

/// Structural validation outcome for one composed component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentValidation {
    pub component: String,
    pub is_valid: bool,
    pub errors: Vec<String>,
}

impl ComponentValidation {
    pub fn valid(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(component: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            component: component.into(),
            is_valid: false,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_location_from_offset() {
        let input = "(a)\n  (b)";
        let loc = SourceLocation::from_offset(input, 6);
        assert_eq!(loc.line, 2);
        assert_eq!(loc.column, 3);
        assert_eq!(loc.to_string(), "2:3");
    }

    #[test]
    fn test_session_state_transitions() {
        assert!(SessionState::Created.can_transition_to(SessionState::Active));
        assert!(SessionState::Active.can_transition_to(SessionState::Completed));
        assert!(SessionState::Active.can_transition_to(SessionState::Failed));
        assert!(SessionState::Completed.can_transition_to(SessionState::Expired));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Active));
        assert!(!SessionState::Completed.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Expired.can_transition_to(SessionState::Expired));
    }

    #[test]
    fn test_entity_type_aliases() {
        assert_eq!(
            EntityType::from_code("proper_person"),
            Some(EntityType::Individual)
        );
        assert_eq!(EntityType::from_code("Company"), Some(EntityType::Corporate));
        assert_eq!(EntityType::from_code("FOUNDATION"), None);
        assert!(!EntityType::Individual.requires_ubo());
        assert!(EntityType::Trust.requires_ubo());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&SessionState::Active).unwrap();
        assert_eq!(json, "\"ACTIVE\"");
        let tier: ComplianceTier = serde_json::from_str("\"ENHANCED\"").unwrap();
        assert_eq!(tier, ComplianceTier::Enhanced);
    }
}
