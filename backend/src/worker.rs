//! Generation worker: a single consumer draining a FIFO job queue.
//!
//! Each job runs the full pipeline before the next one is dequeued:
//!
//! 1. Normalize and translate the style-free prompt, build the fingerprint.
//! 2. On a cache hit, deliver the stored URL without touching upstream.
//! 3. Otherwise pick an account with enough points (rotating on shortfall),
//!    submit the enhanced prompt, poll for the image, store it in the cache.
//!
//! A failed job is reported to its originator and the loop moves on.
//!
//! [`run_worker`] is the only consumer and owns the [`Worker`] outright, so at
//! most one job is ever in flight. The cache's read-then-write relies on that.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::accounts::{Account, SharedAccounts};
use crate::cache::PromptCache;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::prompt::{clean_prompt, PromptDetails};
use crate::translate::{Translator, UrlShortener};
use crate::upstream::{GenerationRequest, ImageApi};

/// Whoever submitted a job; receives its final outcome.
#[async_trait]
pub trait Originator: Send + Sync {
    /// Short name shown in queue status.
    fn label(&self) -> String;

    /// Called once an account has been chosen and generation is starting.
    async fn notify_started(&self, _account: &str) {}

    async fn deliver(&self, outcome: JobOutcome);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        /// Cleaned prompt as the requester wrote it.
        prompt: String,
        image_url: String,
        download_url: String,
        from_cache: bool,
        /// Description of the account that paid for it; `None` on cache hits.
        account: Option<String>,
    },
    Failed {
        reason: String,
    },
}

pub struct Job {
    pub id: Uuid,
    pub originator: Arc<dyn Originator>,
    pub details: PromptDetails,
}

impl Job {
    pub fn new(id: Uuid, originator: Arc<dyn Originator>, details: PromptDetails) -> Self {
        Self {
            id,
            originator,
            details,
        }
    }
}

#[derive(Default)]
struct QueueState {
    depth: AtomicUsize,
    current: Mutex<Option<Arc<dyn Originator>>>,
}

/// Read-only view of the queue for status queries.
#[derive(Clone)]
pub struct QueueStatus {
    state: Arc<QueueState>,
}

impl QueueStatus {
    /// Jobs waiting, not counting the one in flight.
    pub fn depth(&self) -> usize {
        self.state.depth.load(Ordering::SeqCst)
    }

    /// Originator of the job currently being processed.
    pub fn processing(&self) -> Option<Arc<dyn Originator>> {
        self.state
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_current(&self, originator: Option<Arc<dyn Originator>>) {
        *self
            .state
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = originator;
    }
}

/// Producer handle held by the presentation layer.
#[derive(Clone)]
pub struct GenerationQueue {
    tx: mpsc::UnboundedSender<Job>,
    status: QueueStatus,
}

/// Consumer end, owned by [`run_worker`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
    status: QueueStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("the generation worker is not running")]
pub struct QueueClosed;

impl GenerationQueue {
    /// Create the producer handle and the receiver consumed by [`run_worker`].
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = QueueStatus {
            state: Arc::new(QueueState::default()),
        };
        (
            Self {
                tx,
                status: status.clone(),
            },
            JobReceiver { rx, status },
        )
    }

    /// Append a job and return its 1-based position among waiting jobs.
    pub fn enqueue(&self, job: Job) -> Result<usize, QueueClosed> {
        let position = self.status.state.depth.fetch_add(1, Ordering::SeqCst) + 1;
        if self.tx.send(job).is_err() {
            self.status.state.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueClosed);
        }
        Ok(position)
    }

    /// Jobs waiting, not counting the one in flight.
    pub fn depth(&self) -> usize {
        self.status.depth()
    }

    /// Originator of the job currently being processed.
    pub fn processing(&self) -> Option<Arc<dyn Originator>> {
        self.status.processing()
    }

    /// Read-only view that can be handed to originators.
    pub fn status(&self) -> QueueStatus {
        self.status.clone()
    }
}

impl JobReceiver {
    async fn next(&mut self) -> Option<Job> {
        let job = self.rx.recv().await?;
        self.status.state.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}

/// Everything the pipeline needs; owned by the worker task.
pub struct Worker {
    api: Arc<dyn ImageApi>,
    translator: Arc<dyn Translator>,
    shortener: Arc<dyn UrlShortener>,
    accounts: SharedAccounts,
    cache: PromptCache,
    points_per_image: i64,
    metrics: Arc<Metrics>,
}

impl Worker {
    pub fn new(
        api: Arc<dyn ImageApi>,
        translator: Arc<dyn Translator>,
        shortener: Arc<dyn UrlShortener>,
        accounts: SharedAccounts,
        cache: PromptCache,
        points_per_image: i64,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            api,
            translator,
            shortener,
            accounts,
            cache,
            points_per_image,
            metrics,
        }
    }

    /// Run one job to completion, converting any stage error into a failure.
    pub async fn process(&mut self, job: &Job) -> JobOutcome {
        match self.run_pipeline(job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_failure();
                error!(job_id = %job.id, error = %e, "Error processing job");
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, requester = %job.originator.label()))]
    async fn run_pipeline(&mut self, job: &Job) -> Result<JobOutcome, PipelineError> {
        let details = &job.details;
        let cleaned = clean_prompt(&details.prompt);

        let canonical = self.translator.canonicalize(&details.cache_source()).await;
        let fingerprint = details.fingerprint(&canonical);

        if let Some(cached) = self.cache.get(&fingerprint) {
            let image_url = cached.to_string();
            self.metrics.record_cache_hit();
            info!(fingerprint = %fingerprint, "Prompt cache hit");
            let download_url = self.shortener.shorten(&image_url).await;
            return Ok(JobOutcome::Succeeded {
                prompt: cleaned,
                image_url,
                download_url,
                from_cache: true,
                account: None,
            });
        }

        let started = Instant::now();
        let prompt = self.translator.canonicalize(&details.enhanced()).await;
        let account = self.select_account().await?;
        job.originator.notify_started(&account.description).await;

        let request = GenerationRequest {
            prompt,
            size: details.size.clone(),
            seed: details.seed,
            guidance_scale: details.guidance_scale,
        };
        let task_id = self.api.submit(&request, &account).await?;
        info!(task_id = %task_id, account = %account.description, "Generation submitted");

        let images = self.api.poll_status(&task_id, &account).await?;
        let image_url = images
            .into_iter()
            .next()
            .filter(|url| !url.is_empty())
            .ok_or(PipelineError::NoImages)?;

        self.cache.set(fingerprint, image_url.clone());
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.record_generation(latency_ms);
        info!(task_id = %task_id, latency_ms, "Image generated and cached");

        let download_url = self.shortener.shorten(&image_url).await;
        Ok(JobOutcome::Succeeded {
            prompt: cleaned,
            image_url,
            download_url,
            from_cache: false,
            account: Some(account.description),
        })
    }

    /// Walk the rotation at most once, returning the first account whose
    /// live balance covers one image. The cursor stays on that account.
    async fn select_account(&self) -> Result<Account, PipelineError> {
        let total = self.accounts.read().await.len();
        if total == 0 {
            return Err(PipelineError::NoAccounts);
        }

        for _ in 0..total {
            let account = self
                .accounts
                .read()
                .await
                .current_account()
                .cloned()
                .ok_or(PipelineError::NoAccounts)?;

            match self.api.query_quota(&account).await {
                Ok(points) if points >= self.points_per_image => {
                    info!(account = %account.description, points, "Selected account");
                    return Ok(account);
                }
                Ok(points) => warn!(
                    account = %account.description,
                    points,
                    required = self.points_per_image,
                    "Not enough points"
                ),
                Err(e) => warn!(account = %account.description, error = %e, "Quota check failed"),
            }
            self.accounts.write().await.advance();
        }

        Err(PipelineError::QuotaExhausted)
    }
}

/// Main worker loop. Returns when every [`GenerationQueue`] handle is dropped.
pub async fn run_worker(mut worker: Worker, mut jobs: JobReceiver) {
    if worker.accounts.read().await.is_empty() {
        error!("Worker cannot start: no accounts configured");
        return;
    }
    info!("Generation worker is running");

    while let Some(job) = jobs.next().await {
        jobs.status.set_current(Some(job.originator.clone()));
        info!(
            job_id = %job.id,
            requester = %job.originator.label(),
            waiting = jobs.status.depth(),
            "Processing job"
        );

        let outcome = worker.process(&job).await;
        job.originator.deliver(outcome).await;
        jobs.status.set_current(None);
    }

    info!("Job queue closed, shutting down worker");
}
