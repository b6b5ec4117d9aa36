//! Concurrency behaviour of the orchestrator
//!
//! Many tasks sharing one orchestrator: creation under a capacity cap,
//! concurrent accumulation into one session, and slow domains that must not
//! block readers.
//!
//! Run with: cargo test --test concurrency_tests

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use ob_orchestration::domains::template::STANDARD_DOMAINS;
use ob_orchestration::domains::DomainVocabulary;
use ob_orchestration::{
    register_standard_domains, CreateSessionRequest, DomainContext, DomainError, DomainPlugin,
    DomainRegistry, GenerationResponse, OrchestrationError, Orchestrator, OrchestratorConfig,
    TemplateDomain,
};

fn orchestrator(config: OrchestratorConfig) -> Arc<Orchestrator> {
    let registry = DomainRegistry::new();
    register_standard_domains(&registry).unwrap();
    Arc::new(Orchestrator::new(Arc::new(registry), config).unwrap())
}

fn request(i: usize) -> CreateSessionRequest {
    CreateSessionRequest::new(format!("Entity {}", i), "CORPORATE", "US").with_products(["CUSTODY"])
}

/// Custody domain that takes far longer than any caller should wait
struct SlowCustody {
    vocabulary: DomainVocabulary,
    delay: Duration,
}

#[async_trait]
impl DomainPlugin for SlowCustody {
    fn name(&self) -> &str {
        "custody"
    }

    fn vocabulary(&self) -> &DomainVocabulary {
        &self.vocabulary
    }

    async fn generate_dsl(
        &self,
        _instruction: &str,
        _context: &DomainContext,
    ) -> Result<GenerationResponse, DomainError> {
        tokio::time::sleep(self.delay).await;
        Ok(GenerationResponse::new("(custody.open.account)"))
    }
}

fn orchestrator_with_slow_custody(config: OrchestratorConfig, delay: Duration) -> Arc<Orchestrator> {
    let registry = DomainRegistry::new();
    registry
        .register(Arc::new(SlowCustody {
            vocabulary: DomainVocabulary::default(),
            delay,
        }))
        .unwrap();
    for definition in STANDARD_DOMAINS.iter().filter(|d| d.name != "custody") {
        registry
            .register(Arc::new(TemplateDomain::from_definition(definition)))
            .unwrap();
    }
    Arc::new(Orchestrator::new(Arc::new(registry), config).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fifty_concurrent_creations_fill_the_cap_exactly() {
    let orch = orchestrator(OrchestratorConfig::default().with_max_sessions(50));

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.create_session(request(i)).await })
        })
        .collect();
    let ids: BTreeSet<String> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().session_id)
        .collect();
    assert_eq!(ids.len(), 50);

    let err = orch.create_session(request(50)).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::CapacityExceeded { limit: 50 }));
    assert!(err.is_capacity());

    let metrics = orch.get_metrics().await;
    assert_eq!(metrics.total_sessions, 50);
    assert_eq!(metrics.active_sessions, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_creations_never_exceed_the_cap() {
    let orch = orchestrator(OrchestratorConfig::default().with_max_sessions(10));

    let handles: Vec<_> = (0..30)
        .map(|i| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.create_session(request(i)).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let created = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(OrchestrationError::CapacityExceeded { .. })))
        .count();
    assert_eq!(created, 10);
    assert_eq!(rejected, 20);
    assert_eq!(orch.list_active_sessions().await.unwrap().len(), 10);

    // Freed capacity can be reused
    let first = results.iter().flatten().next().unwrap().session_id.clone();
    assert!(orch.delete_session(&first).await.unwrap());
    orch.create_session(request(99)).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accumulation_loses_nothing() {
    let orch = orchestrator(OrchestratorConfig::default());
    let id = orch.create_session(request(0)).await.unwrap().session_id;

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let orch = orch.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let domain = if i % 2 == 0 { "kyc" } else { "custody" };
                orch.accumulate_dsl(&id, domain, &format!("(step.{})", i)).await
            })
        })
        .collect();
    let versions: BTreeSet<u64> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    // Every call saw a distinct version
    assert_eq!(versions, (1..=20).collect());

    let session = orch.get_session(&id).await.unwrap();
    assert_eq!(session.version_number(), 20);
    let fragments: Vec<&str> = session.unified_dsl().split("\n\n").collect();
    assert_eq!(fragments.len(), 20);
    for i in 0..20 {
        let fragment = format!("(step.{})", i);
        assert_eq!(fragments.iter().filter(|f| **f == fragment).count(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn instructions_on_separate_sessions_run_in_parallel() {
    let orch = orchestrator(OrchestratorConfig::default());
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(orch.create_session(request(i)).await.unwrap().session_id);
    }

    let handles: Vec<_> = ids
        .iter()
        .cloned()
        .map(|id| {
            let orch = orch.clone();
            tokio::spawn(async move {
                orch.execute_instruction(&id, "verify identity documents").await
            })
        })
        .collect();
    for joined in join_all(handles).await {
        let result = joined.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.version, 1);
    }
    assert_eq!(orch.get_metrics().await.domains_coordinated["kyc"], 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_domain_does_not_block_readers() {
    let orch = orchestrator_with_slow_custody(OrchestratorConfig::default(), Duration::from_millis(500));
    let id = orch.create_session(request(0)).await.unwrap().session_id;

    let running = {
        let orch = orch.clone();
        let id = id.clone();
        tokio::spawn(async move { orch.execute_instruction(&id, "open custody account").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = tokio::time::timeout(Duration::from_millis(200), orch.get_session(&id))
        .await
        .expect("session readable while a domain is generating")
        .unwrap();
    assert_eq!(snapshot.version_number(), 0);

    let result = running.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn generation_timeout_is_reported_per_domain() {
    let config = OrchestratorConfig::default().with_generation_timeout(Duration::from_secs(1));
    let orch = orchestrator_with_slow_custody(config, Duration::from_secs(30));
    let id = orch.create_session(request(0)).await.unwrap().session_id;

    let result = orch
        .execute_instruction(&id, "verify identity and open custody account")
        .await
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.processed_domains, vec!["kyc"]);
    assert_eq!(
        result.errors,
        vec!["domain custody failed: Domain 'custody' did not respond within 1s"]
    );
    assert_eq!(result.version, 1);
}
