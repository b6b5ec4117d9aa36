//! Execution Planner
//!
//! Turns a domain dependency map into ordered execution stages by iterative
//! topological layering. Every stage holds the domains whose dependencies
//! are all placed in earlier stages; domains inside a stage are sorted by
//! name so identical inputs always yield identical plans. A layer that
//! makes no progress means the graph has a cycle, and planning fails.

use chrono::{DateTime, Utc};
use dsl_types::{ContextAnalysis, ExecutionPlan, ExecutionStage, StageState};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::error::PlanError;

/// Relative effort of a domain, applied to the base stage duration
pub fn domain_multiplier(domain: &str) -> f64 {
    match domain {
        "onboarding" => 1.0,
        "kyc" => 2.0,
        "ubo" => 3.0,
        "trust-kyc" => 2.5,
        "custody" => 2.0,
        "trading" => 1.5,
        "fund-accounting" => 2.0,
        "hedge-fund-investor" => 2.0,
        d if d == "compliance" || d.ends_with("-compliance") => 2.5,
        _ => 1.0,
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    base_stage_duration: Duration,
    allow_parallel: bool,
    max_depth: usize,
}

impl Default for ExecutionPlanner {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

impl ExecutionPlanner {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            base_stage_duration: config.base_stage_duration,
            allow_parallel: config.enable_parallel_execution,
            max_depth: config.max_domain_depth,
        }
    }

    pub fn with_base_stage_duration(mut self, duration: Duration) -> Self {
        self.base_stage_duration = duration;
        self
    }

    pub fn plan(&self, analysis: &ContextAnalysis) -> Result<ExecutionPlan, PlanError> {
        self.plan_at(analysis, Utc::now())
    }

    /// Plan with a caller-supplied creation timestamp
    pub fn plan_at(
        &self,
        analysis: &ContextAnalysis,
        created_at: DateTime<Utc>,
    ) -> Result<ExecutionPlan, PlanError> {
        self.plan_graph(&analysis.required_domains, &analysis.dependencies, created_at)
    }

    pub fn plan_graph(
        &self,
        domains: &[String],
        dependencies: &BTreeMap<String, Vec<String>>,
        created_at: DateTime<Utc>,
    ) -> Result<ExecutionPlan, PlanError> {
        let universe: BTreeSet<&str> = domains.iter().map(String::as_str).collect();
        if universe.is_empty() {
            return Err(PlanError::EmptyDomainSet);
        }
        for (domain, deps) in dependencies {
            if !universe.contains(domain.as_str()) {
                return Err(PlanError::UnknownDependency {
                    domain: domain.clone(),
                    dependency: domain.clone(),
                });
            }
            if let Some(missing) = deps.iter().find(|d| !universe.contains(d.as_str())) {
                return Err(PlanError::UnknownDependency {
                    domain: domain.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        let deps_of = |domain: &str| -> &[String] {
            dependencies
                .get(domain)
                .map(Vec::as_slice)
                .unwrap_or(&[])
        };

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining = universe.clone();
        let mut stages = Vec::new();

        while !remaining.is_empty() {
            // BTreeSet iteration gives the lexicographic tie-break
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|d| deps_of(d).iter().all(|dep| placed.contains(dep.as_str())))
                .collect();

            if ready.is_empty() {
                let stuck: Vec<&str> = remaining.iter().copied().collect();
                return Err(PlanError::CircularDependency {
                    domains: stuck.join(", "),
                });
            }

            let stage_deps: BTreeSet<String> = ready
                .iter()
                .flat_map(|d| deps_of(d).iter().cloned())
                .collect();
            let number = stages.len() + 1;
            let domains: Vec<String> = ready.iter().map(|d| d.to_string()).collect();

            stages.push(ExecutionStage {
                number,
                name: format!("stage_{}", number),
                estimated_duration_ms: self.stage_duration(&domains),
                parallel: self.allow_parallel && domains.len() > 1,
                dependencies: stage_deps.iter().cloned().collect(),
                required_inputs: stage_deps.into_iter().collect(),
                produced_outputs: domains.clone(),
                domains,
                state: StageState::Pending,
            });

            for domain in ready {
                remaining.remove(domain);
                placed.insert(domain);
            }
        }

        let depth = stages.len() - 1;
        if depth > self.max_depth {
            return Err(PlanError::DepthExceeded {
                depth,
                max: self.max_depth,
            });
        }

        let parallel_groups = stages
            .iter()
            .filter(|s| s.parallel)
            .map(|s| s.domains.clone())
            .collect();
        let critical_path = stages
            .iter()
            .filter(|s| s.domains.len() == 1)
            .map(|s| s.name.clone())
            .collect();
        let estimated_duration_ms = stages.iter().map(|s| s.estimated_duration_ms).sum();

        debug!(
            stages = stages.len(),
            estimated_ms = estimated_duration_ms,
            "execution plan built"
        );

        Ok(ExecutionPlan {
            stages,
            dependencies: dependencies.clone(),
            parallel_groups,
            critical_path,
            estimated_duration_ms,
            created_at,
        })
    }

    fn stage_duration(&self, domains: &[String]) -> u64 {
        let multiplier = domains
            .iter()
            .map(|d| domain_multiplier(d))
            .fold(1.0_f64, f64::max);
        (self.base_stage_duration.as_millis() as f64 * multiplier).round() as u64
    }
}
