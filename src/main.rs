use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use stratus::api::{router, AppState};
use stratus::config::StratusConfig;
use stratus::driver::ChromiumDriver;
use stratus::engine::TaskEngine;
use stratus::oracle::HttpOracle;
use stratus::storage::{
    InMemoryBlobStore, InMemoryStorage, RecordingEmail, StaticSecrets, Storage,
};
use stratus::types::Organization;
use stratus::workflow::{BlockRuntime, BlockRuntimeConfig, WorkflowOrchestrator};
use stratus::BrowserSessionManager;

#[derive(Parser, Debug)]
#[command(name = "stratus-server", about = "Browser automation execution server")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed API key mapped to a development organization.
    #[arg(long, default_value = "dev-key")]
    dev_api_key: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stratus=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => StratusConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => StratusConfig::default(),
    };

    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let blob = Arc::new(InMemoryBlobStore::new());
    let secrets = Arc::new(StaticSecrets::default());
    let email = Arc::new(RecordingEmail::new());

    // Development seed so the API is usable out of the box.
    let org = Organization::new("dev", "pro");
    storage.create_organization(&org).await.ok();
    storage
        .register_api_key(&args.dev_api_key, &org.organization_id)
        .await
        .ok();
    info!(organization_id = %org.organization_id, "seeded dev organization");

    let driver = Arc::new(ChromiumDriver::new());
    let sessions = Arc::new(BrowserSessionManager::new(
        driver,
        storage.clone(),
        blob.clone(),
        config.session_pool(),
    ));
    let _reaper = sessions.spawn_idle_reaper();

    let oracle = Arc::new(
        HttpOracle::new(config.http_oracle()).context("building oracle client")?,
    );
    let engine = Arc::new(TaskEngine::new(
        storage.clone(),
        blob.clone(),
        sessions.clone(),
        oracle.clone(),
        config.task_engine(),
    ));
    let runtime = BlockRuntime::new(
        engine.clone(),
        storage.clone(),
        blob.clone(),
        email,
        oracle,
        BlockRuntimeConfig::default(),
    );
    let orchestrator = Arc::new(WorkflowOrchestrator::new(
        storage.clone(),
        sessions.clone(),
        secrets,
        runtime,
        config.orchestrator(),
    ));

    let state = AppState::new(
        storage,
        sessions,
        engine,
        orchestrator,
        config.concurrency.global_concurrent_runs,
        config.concurrency.tenant_concurrent_runs,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("listening on {}", addr);
    axum::serve(listener, router(state)).await.context("server loop")?;
    Ok(())
}
