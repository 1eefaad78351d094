//! Image Generation Backend
//!
//! Accepts image-generation requests, serializes them through a single-worker
//! queue, rotates across upstream accounts to spread point usage, and caches
//! finished results by prompt fingerprint. Runs two concurrent subsystems:
//!
//! - **Worker**: drains the job queue one job at a time.
//! - **HTTP server**: job submission, queue state, owner-only administration.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod accounts;
mod cache;
mod config;
mod error;
mod metrics;
mod prompt;
mod server;
mod translate;
mod upstream;
mod worker;

use accounts::AccountStore;
use cache::PromptCache;
use config::AppConfig;
use metrics::Metrics;
use server::{AppState, JobBoard};
use translate::{GoogleTranslator, TinyUrlShortener};
use upstream::{ImageApi, VmosClient};
use worker::{GenerationQueue, Worker};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,reqwest=warn,actix_server=warn")),
        )
        .with_target(true)
        .with_ansi(true)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let accounts = AccountStore::open(&config.accounts_file);
    anyhow::ensure!(
        !accounts.is_empty(),
        "cannot start: {} is missing, empty or invalid",
        config.accounts_file.display()
    );
    let cache = PromptCache::open(&config.prompt_cache_file);

    info!(
        accounts = accounts.len(),
        cached_prompts = cache.len(),
        points_per_image = config.points_per_image,
        "Starting image generation backend"
    );
    info!(api = %config.api_base_url, "Upstream configured");

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build HTTP client")?;

    let accounts = accounts.into_shared();
    let api: Arc<dyn ImageApi> = Arc::new(VmosClient::new(http.clone(), &config.api_base_url));
    let metrics = Arc::new(Metrics::new());
    let (queue, jobs) = GenerationQueue::new();

    let worker = Worker::new(
        api.clone(),
        Arc::new(GoogleTranslator::new(http.clone())),
        Arc::new(TinyUrlShortener::new(http)),
        accounts.clone(),
        cache,
        config.points_per_image,
        metrics.clone(),
    );

    // Background: consume the job queue.
    tokio::spawn(worker::run_worker(worker, jobs));

    let state = AppState {
        queue,
        accounts,
        api,
        metrics,
        board: JobBoard::default(),
        owner_token: config.bot_token.clone(),
    };

    server::run(state, config.http_port).await?;
    Ok(())
}
