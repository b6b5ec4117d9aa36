//! End-to-end orchestration flows
//!
//! Drives the public API the way a caller would: create a session from a
//! case description, push instructions and orchestration phrases through it,
//! run its stages and read it back.
//!
//! Run with: cargo test --test orchestration_integration

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use ob_orchestration::error::PlanError;
use ob_orchestration::{
    register_standard_domains, ComplianceTier, ConflictStrategy, CreateSessionRequest,
    DomainRegistry, ExecutionPlanner, JsonFileSessionStore, OrchestrationError, Orchestrator,
    OrchestratorConfig, SessionState, WorkflowType,
};

fn registry() -> Arc<DomainRegistry> {
    let registry = DomainRegistry::new();
    register_standard_domains(&registry).unwrap();
    Arc::new(registry)
}

fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(registry(), config).unwrap()
}

#[tokio::test]
async fn corporate_us_custody_and_trading_runs_to_completion() {
    let orch = orchestrator(OrchestratorConfig::default());
    let session = orch
        .create_session(
            CreateSessionRequest::new("Acme Holdings Inc", "CORPORATE", "US")
                .with_cbu_id("CBU-2025-001")
                .with_products(["CUSTODY", "TRADING"]),
        )
        .await
        .unwrap();

    let plan = &session.execution_plan;
    assert_eq!(session.primary_domain, "onboarding");
    assert_eq!(session.shared_context.compliance_tier, ComplianceTier::Enhanced);
    assert_eq!(
        session.domain_names(),
        vec!["onboarding", "kyc", "ubo", "custody", "us-compliance", "trading"]
    );
    assert!(plan.stage_of("kyc") > plan.stage_of("onboarding"));
    assert!(plan.stage_of("ubo") > plan.stage_of("kyc"));
    assert!(plan.stage_of("trading") > plan.stage_of("custody"));
    assert!(session.master_dsl.contains("orchestration.session.initialize"));

    let processing = orch
        .execute_orchestration_instruction(&session.session_id, "validate products")
        .await
        .unwrap();
    assert!(processing.success, "{:?}", processing.errors);
    assert_eq!(processing.processed_verbs, vec!["products.validate.compatibility"]);

    let mut stages_run = 0;
    loop {
        let result = orch
            .run_next_stage(&session.session_id, "continue onboarding")
            .await
            .unwrap();
        if result.processed_domains.is_empty() {
            break;
        }
        assert!(result.success, "{:?}", result.errors);
        stages_run += 1;
    }
    assert_eq!(stages_run, plan.total_stages());

    let status = orch.get_session_status(&session.session_id, true).await.unwrap();
    assert_eq!(status.current_state, SessionState::Completed);
    assert_eq!(status.version, 7);
    assert!(status.active_domains.iter().all(|d| d.has_dsl));

    let metrics = orch.get_metrics().await;
    assert_eq!(metrics.completed_workflows, 1);
    assert_eq!(metrics.domains_coordinated.len(), 6);
    assert!(metrics.domains_coordinated.values().all(|count| *count == 1));
}

#[tokio::test]
async fn individual_hedge_fund_investment_needs_only_investor_and_kyc() {
    let orch = orchestrator(OrchestratorConfig::default());
    let session = orch
        .create_session(
            CreateSessionRequest::new("Jane Doe", "INDIVIDUAL", "KY")
                .with_investor_id("INV-77")
                .with_products(["HEDGE_FUND_INVESTMENT"])
                .with_workflow_type(WorkflowType::Investment),
        )
        .await
        .unwrap();

    assert_eq!(session.primary_domain, "hedge-fund-investor");
    let domains: Vec<&str> = session.active_domains.keys().map(String::as_str).collect();
    assert_eq!(domains, vec!["hedge-fund-investor", "kyc"]);
    assert_eq!(session.execution_plan.stage_of("kyc"), Some(1));
    assert_eq!(session.execution_plan.stage_of("hedge-fund-investor"), Some(2));

    let result = orch
        .execute_instruction(&session.session_id, "Process the investor subscription")
        .await
        .unwrap();
    assert_eq!(result.target_domains, vec!["hedge-fund-investor"]);
    assert!(result.generated_dsl.contains("INV-77"));
}

#[tokio::test]
async fn unroutable_instruction_falls_back_to_primary_domain() {
    let orch = orchestrator(OrchestratorConfig::default());
    let session = orch
        .create_session(CreateSessionRequest::new("Beta LP", "PARTNERSHIP", "GB"))
        .await
        .unwrap();

    let result = orch
        .execute_instruction(&session.session_id, "get things moving")
        .await
        .unwrap();
    assert_eq!(result.target_domains, vec!["onboarding"]);
    assert_eq!(result.version, 1);
}

#[tokio::test]
async fn orchestration_phrases_share_and_sync_attributes() {
    let orch = orchestrator(OrchestratorConfig::default());
    let id = orch
        .create_session(
            CreateSessionRequest::new("Gamma AG", "CORPORATE", "CH").with_products(["CUSTODY"]),
        )
        .await
        .unwrap()
        .session_id;

    orch.execute_orchestration_instruction(&id, "initialize shared state")
        .await
        .unwrap();

    let plan = orch
        .update_attribute(&id, "entity.legal_name", "Gamma Holding AG", "kyc", ConflictStrategy::SourceWins)
        .await
        .unwrap()
        .expect("legal name is shared between domains");
    assert!(plan.targets.contains(&"custody".to_string()));
    assert!(!plan.targets.contains(&"kyc".to_string()));

    let session = orch.get_session(&id).await.unwrap();
    assert_eq!(
        session.shared_context.attribute_values["entity.legal_name"].value,
        "Gamma Holding AG"
    );
    let context = session.build_domain_context("custody").unwrap();
    assert_eq!(context.get_str("entity.legal_name"), Some("Gamma Holding AG"));

    let explicit = orch
        .execute_orchestration_instruction(
            &id,
            r#"(domain.route.to (domain "custody") (dsl.fragment "(custody.open.account)"))"#,
        )
        .await
        .unwrap();
    assert!(explicit.success, "{:?}", explicit.errors);
    assert!(orch.get_metrics().await.cross_domain_references > 0);
}

#[tokio::test]
async fn failed_session_rejects_further_work() {
    let orch = orchestrator(OrchestratorConfig::default());
    let id = orch
        .create_session(CreateSessionRequest::new("Delta Trust", "TRUST", "DE"))
        .await
        .unwrap()
        .session_id;

    orch.accumulate_dsl(&id, "kyc", "(kyc.start)").await.unwrap();
    orch.fail_session(&id, Some("kyc"), "sanctions match").await.unwrap();

    let err = orch.execute_instruction(&id, "verify identity").await.unwrap_err();
    assert!(matches!(err, OrchestrationError::InvalidTransition { .. }));
    assert!(err.is_validation());

    let session = orch.get_session(&id).await.unwrap();
    assert_eq!(session.current_state(), SessionState::Failed);
    assert_eq!(session.unified_dsl(), "(kyc.start)");
    assert_eq!(session.state_history().last().unwrap().reason, "sanctions match");
    assert_eq!(orch.get_metrics().await.failed_workflows, 1);
}

#[tokio::test]
async fn expired_sessions_are_swept() {
    let orch = orchestrator(
        OrchestratorConfig::default().with_session_timeout(std::time::Duration::from_secs(3600)),
    );
    let mut ids = Vec::new();
    for name in ["one", "two", "three"] {
        let session = orch
            .create_session(CreateSessionRequest::new(name, "CORPORATE", "US"))
            .await
            .unwrap();
        ids.push(session.session_id);
    }
    orch.backdate_session(&ids[0], Duration::hours(2)).await.unwrap();
    orch.backdate_session(&ids[2], Duration::hours(2)).await.unwrap();

    // Expired but not yet swept
    assert_eq!(orch.get_metrics().await.active_sessions, 1);

    assert!(matches!(
        orch.get_session(&ids[0]).await,
        Err(OrchestrationError::SessionNotFound { .. })
    ));
    assert_eq!(orch.cleanup_expired_sessions().await.unwrap(), 2);

    let active = orch.list_active_sessions().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, ids[1]);
    assert_eq!(orch.get_metrics().await.active_sessions, 1);
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();

    let id = {
        let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
        let orch = Orchestrator::new(registry.clone(), OrchestratorConfig::default())
            .unwrap()
            .with_store(store);
        let id = orch
            .create_session(
                CreateSessionRequest::new("Epsilon SA", "CORPORATE", "FR")
                    .with_session_id("epsilon-1")
                    .with_products(["FUND_ACCOUNTING"]),
            )
            .await
            .unwrap()
            .session_id;
        orch.execute_instruction(&id, "calculate the daily NAV")
            .await
            .unwrap();
        id
    };

    let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
    let orch = Orchestrator::new(registry, OrchestratorConfig::default())
        .unwrap()
        .with_store(store);
    let restored = orch.get_session(&id).await.unwrap();
    assert_eq!(restored.session_id, "epsilon-1");
    assert_eq!(restored.version_number(), 1);
    assert!(!restored.unified_dsl().is_empty());
    assert!(restored.active_domains.contains_key("eu-compliance"));

    assert!(orch.delete_session(&id).await.unwrap());
    assert!(!dir.path().join("epsilon-1.json").exists());
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let orch = orchestrator(OrchestratorConfig::default());
    let request = CreateSessionRequest::new("Zeta", "CORPORATE", "US").with_session_id("fixed");
    orch.create_session(request.clone()).await.unwrap();

    let err = orch.create_session(request).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::SessionAlreadyExists { .. }));
    assert_eq!(orch.get_metrics().await.total_sessions, 1);
}

#[tokio::test]
async fn invalid_case_descriptions_are_validation_errors() {
    let orch = orchestrator(OrchestratorConfig::default());

    let err = orch
        .create_session(CreateSessionRequest::new("X", "ROBOT", "US"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = orch
        .create_session(CreateSessionRequest::new("X", "CORPORATE", "USA"))
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = orch
        .create_session(CreateSessionRequest::new("X", "CORPORATE", "US").with_products(["SPACE_TRAVEL"]))
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(orch.get_metrics().await.total_sessions, 0);
}

#[test]
fn cyclic_dependencies_are_rejected() {
    let domains = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let mut dependencies = BTreeMap::new();
    dependencies.insert("a".to_string(), vec!["c".to_string()]);
    dependencies.insert("b".to_string(), vec!["a".to_string()]);
    dependencies.insert("c".to_string(), vec!["b".to_string()]);

    let err = ExecutionPlanner::default()
        .plan_graph(&domains, &dependencies, Utc::now())
        .unwrap_err();
    assert!(matches!(err, PlanError::CircularDependency { .. }));
    assert!(OrchestrationError::from(err).is_structural());
}

#[test]
fn planning_is_deterministic() {
    let domains: Vec<String> = ["trading", "custody", "kyc", "onboarding", "ubo"]
        .iter()
        .map(|d| d.to_string())
        .collect();
    let mut dependencies = BTreeMap::new();
    dependencies.insert("kyc".to_string(), vec!["onboarding".to_string()]);
    dependencies.insert("ubo".to_string(), vec!["kyc".to_string()]);
    dependencies.insert("custody".to_string(), vec!["ubo".to_string()]);
    dependencies.insert("trading".to_string(), vec!["custody".to_string()]);

    let at = Utc::now();
    let planner = ExecutionPlanner::default();
    let first = planner.plan_graph(&domains, &dependencies, at).unwrap();
    let second = planner.plan_graph(&domains, &dependencies, at).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.total_stages(), 5);
    assert_eq!(first.stages[4].domains, vec!["trading"]);
    assert_eq!(first.critical_path.len(), 5);
}

#[tokio::test]
async fn sweep_keeps_store_records_of_live_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();
    let config =
        OrchestratorConfig::default().with_session_timeout(std::time::Duration::from_millis(1500));

    let id = {
        let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
        let orch = Orchestrator::new(registry.clone(), config.clone())
            .unwrap()
            .with_store(store);
        let id = orch
            .create_session(CreateSessionRequest::new("Zeta Ltd", "CORPORATE", "GB").with_products(["CUSTODY"]))
            .await
            .unwrap()
            .session_id;

        // Used halfway through its timeout, swept after the creation-time
        // expiry has passed
        tokio::time::sleep(std::time::Duration::from_millis(900)).await;
        orch.execute_instruction(&id, "open custody account").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(900)).await;

        assert_eq!(orch.cleanup_expired_sessions().await.unwrap(), 0);
        assert!(dir.path().join(format!("{}.json", id)).exists());
        id
    };

    let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
    let orch = Orchestrator::new(registry, config).unwrap().with_store(store);
    let restored = orch.get_session(&id).await.unwrap();
    assert_eq!(restored.version_number(), 1);
}

#[tokio::test]
async fn restored_session_matches_the_live_one() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry();

    let (id, live) = {
        let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
        let orch = Orchestrator::new(registry.clone(), OrchestratorConfig::default())
            .unwrap()
            .with_store(store);
        let id = orch
            .create_session(CreateSessionRequest::new("Eta GmbH", "CORPORATE", "CH").with_products(["CUSTODY"]))
            .await
            .unwrap()
            .session_id;

        orch.execute_instruction(&id, "verify identity documents").await.unwrap();
        orch.complete_domain(&id, "onboarding", "case opened").await.unwrap();
        orch.execute_orchestration_instruction(&id, "initialize shared state")
            .await
            .unwrap();
        orch.update_attribute(&id, "entity.legal_name", "Eta Holding GmbH", "kyc", ConflictStrategy::SourceWins)
            .await
            .unwrap();
        orch.accumulate_dsl(&id, "custody", "(custody.open.account)").await.unwrap();

        let live = orch.get_session(&id).await.unwrap();
        (id, live)
    };
    assert_eq!(live.current_state(), SessionState::Active);

    let store = Arc::new(JsonFileSessionStore::open(dir.path()).await.unwrap());
    let orch = Orchestrator::new(registry, OrchestratorConfig::default())
        .unwrap()
        .with_store(store);
    let restored = orch.get_session(&id).await.unwrap();

    assert_eq!(restored.current_state(), live.current_state());
    assert_eq!(restored.version_number(), live.version_number());
    assert_eq!(restored.unified_dsl(), live.unified_dsl());
    assert_eq!(restored.domain_dsl, live.domain_dsl);
    assert!(restored.domain_dsl.contains_key("kyc"));
    assert_eq!(restored.state_history().len(), live.state_history().len());
    assert_eq!(
        restored.shared_context.attribute_values["entity.legal_name"].value,
        "Eta Holding GmbH"
    );
    let states = |s: &ob_orchestration::OrchestrationSession| -> BTreeMap<String, String> {
        s.active_domains
            .iter()
            .map(|(name, d)| (name.clone(), d.state.to_string()))
            .collect()
    };
    assert_eq!(states(&restored), states(&live));
    assert_eq!(states(&restored)["onboarding"], "COMPLETED");
}
