//! Shared harness: fake driver, scripted oracle, in-memory capabilities.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use stratus::action::ActionConfig;
use stratus::driver::fake::{ElementSpec, FakeDriver, FakeSite};
use stratus::engine::{TaskEngine, TaskEngineConfig};
use stratus::oracle::ScriptedOracle;
use stratus::session::{BrowserSessionManager, SessionPoolConfig};
use stratus::storage::{
    InMemoryBlobStore, InMemoryStorage, RecordingEmail, StaticSecrets, Storage,
};
use stratus::types::Organization;
use stratus::workflow::{
    BlockRuntime, BlockRuntimeConfig, OrchestratorConfig, WorkflowOrchestrator,
};

pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub blob: Arc<InMemoryBlobStore>,
    pub driver: Arc<FakeDriver>,
    pub sessions: Arc<BrowserSessionManager>,
    pub oracle: Arc<ScriptedOracle>,
    pub engine: Arc<TaskEngine>,
    pub email: Arc<RecordingEmail>,
    pub orchestrator: Arc<WorkflowOrchestrator>,
    pub org: Organization,
}

impl Harness {
    pub async fn new(site: FakeSite, oracle: ScriptedOracle) -> Self {
        Self::with_secrets(site, oracle, Default::default()).await
    }

    pub async fn with_secrets(
        site: FakeSite,
        oracle: ScriptedOracle,
        secret_values: std::collections::HashMap<String, String>,
    ) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let storage_dyn: Arc<dyn Storage> = storage.clone();
        let blob = Arc::new(InMemoryBlobStore::new());
        let driver = Arc::new(FakeDriver::new(site));
        let sessions = Arc::new(BrowserSessionManager::new(
            driver.clone(),
            storage_dyn.clone(),
            blob.clone(),
            SessionPoolConfig {
                acquire_timeout: Duration::from_secs(5),
                ..SessionPoolConfig::default()
            },
        ));
        let oracle = Arc::new(oracle);
        let engine = Arc::new(TaskEngine::new(
            storage_dyn.clone(),
            blob.clone(),
            sessions.clone(),
            oracle.clone(),
            TaskEngineConfig {
                action: ActionConfig {
                    element_stability_timeout: Duration::from_millis(200),
                    post_action_settle: Duration::from_millis(100),
                    ..ActionConfig::default()
                },
                ..TaskEngineConfig::default()
            },
        ));
        let email = Arc::new(RecordingEmail::new());
        let runtime = BlockRuntime::new(
            engine.clone(),
            storage_dyn.clone(),
            blob.clone(),
            email.clone(),
            oracle.clone(),
            BlockRuntimeConfig::default(),
        );
        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            storage_dyn.clone(),
            sessions.clone(),
            Arc::new(StaticSecrets::new(secret_values)),
            runtime,
            OrchestratorConfig::default(),
        ));

        let org = Organization::new("test-org", "pro");
        storage.create_organization(&org).await.unwrap();

        Self {
            storage,
            blob,
            driver,
            sessions,
            oracle,
            engine,
            email,
            orchestrator,
            org,
        }
    }
}

/// The standard login page used by several scenarios.
pub fn login_site() -> FakeSite {
    FakeSite::new().page(
        "https://ex.test/login",
        vec![
            ElementSpec::new("input", "#email")
                .attr("name", "email")
                .at_path(vec![0, 0]),
            ElementSpec::new("input", "#password")
                .attr("name", "password")
                .attr("type", "password")
                .at_path(vec![0, 1]),
            ElementSpec::new("button", "#submit")
                .text("Sign in")
                .at_path(vec![0, 2]),
        ],
    )
}
