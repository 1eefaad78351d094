//! HTTP front end: enqueues generation jobs, reports queue state, and exposes
//! owner-only account administration.
//!
//! Job outcomes are kept in an in-memory [`JobBoard`] and fetched by id.

use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::accounts::{AccountUpdate, SharedAccounts};
use crate::error::AccountError;
use crate::metrics::Metrics;
use crate::prompt::{AspectRatio, PromptDetails, Style};
use crate::upstream::ImageApi;
use crate::worker::{GenerationQueue, Job, JobOutcome, Originator};

/// Shared application state accessible from HTTP handlers.
pub struct AppState {
    pub queue: GenerationQueue,
    pub accounts: SharedAccounts,
    pub api: Arc<dyn ImageApi>,
    pub metrics: Arc<Metrics>,
    pub board: JobBoard,
    /// Bearer token required on owner-only routes.
    pub owner_token: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum JobState {
    Pending {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        account: Option<String>,
    },
    Done(JobOutcome),
}

/// Finished outcomes kept before the oldest is dropped.
const FINISHED_JOBS_KEPT: usize = 1000;

#[derive(Default)]
struct BoardEntries {
    states: HashMap<Uuid, JobState>,
    /// Finished job ids, oldest first.
    finished: VecDeque<Uuid>,
}

/// Last known state of jobs submitted over HTTP. Queued and running jobs are
/// always kept; only the newest finished outcomes are retained.
#[derive(Clone)]
pub struct JobBoard {
    entries: Arc<Mutex<BoardEntries>>,
    keep_finished: usize,
}

impl Default for JobBoard {
    fn default() -> Self {
        Self::with_capacity(FINISHED_JOBS_KEPT)
    }
}

impl JobBoard {
    /// Board that retains at most `keep_finished` finished outcomes.
    pub fn with_capacity(keep_finished: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BoardEntries::default())),
            keep_finished,
        }
    }

    fn set(&self, id: Uuid, state: JobState) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let finished = matches!(state, JobState::Done(_));
        entries.states.insert(id, state);
        if finished {
            entries.finished.push_back(id);
            while entries.finished.len() > self.keep_finished {
                if let Some(oldest) = entries.finished.pop_front() {
                    entries.states.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, id: &Uuid) -> Option<JobState> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .states
            .get(id)
            .cloned()
    }
}

/// Originator for a job submitted over HTTP.
struct HttpOriginator {
    job_id: Uuid,
    requester: String,
    board: JobBoard,
}

#[async_trait]
impl Originator for HttpOriginator {
    fn label(&self) -> String {
        self.requester.clone()
    }

    async fn notify_started(&self, account: &str) {
        self.board.set(
            self.job_id,
            JobState::Pending {
                status: "processing",
                account: Some(account.to_string()),
            },
        );
    }

    async fn deliver(&self, outcome: JobOutcome) {
        self.board.set(self.job_id, JobState::Done(outcome));
    }
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default)]
    style: Style,
    #[serde(default)]
    aspect_ratio: AspectRatio,
    negative_prompt: Option<String>,
    #[serde(default = "default_guidance_scale")]
    guidance_scale: f64,
    #[serde(default = "default_seed")]
    seed: i64,
    requester: Option<String>,
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_seed() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
struct NewAccountBody {
    token: String,
    user_id: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct EditAccountBody {
    match_token: String,
    match_user_id: String,
    #[serde(flatten)]
    update: AccountUpdate,
}

fn is_owner(req: &HttpRequest, state: &AppState) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == state.owner_token)
}

fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().json(serde_json::json!({"error": "owner only"}))
}

fn account_error(e: AccountError) -> HttpResponse {
    let body = serde_json::json!({"error": e.to_string()});
    match e {
        AccountError::Duplicate => HttpResponse::Conflict().json(body),
        AccountError::NotFound => HttpResponse::NotFound().json(body),
        AccountError::Io(_) | AccountError::Json(_) => {
            warn!(error = %e, "Account file operation failed");
            HttpResponse::InternalServerError().json(body)
        }
    }
}

/// Liveness probe: 200 while the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Readiness probe with metrics and queue state.
async fn status(data: web::Data<AppState>) -> HttpResponse {
    let accounts = data.accounts.read().await.len();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "running",
        "accounts": accounts,
        "queue_depth": data.queue.depth(),
        "processing": data.queue.processing().map(|o| o.label()),
        "metrics": data.metrics.to_json(),
    }))
}

async fn generate(data: web::Data<AppState>, body: web::Json<GenerateBody>) -> HttpResponse {
    let body = body.into_inner();
    if data.accounts.read().await.is_empty() {
        return HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({"error": "the bot has no accounts configured"}));
    }

    let details = match PromptDetails::new(
        body.prompt,
        body.style,
        body.aspect_ratio,
        body.negative_prompt,
        body.guidance_scale,
        body.seed,
    ) {
        Ok(d) => d,
        Err(e) => return HttpResponse::BadRequest().json(serde_json::json!({"error": e.to_string()})),
    };

    let job_id = Uuid::new_v4();
    let originator = Arc::new(HttpOriginator {
        job_id,
        requester: body.requester.unwrap_or_else(|| format!("job {job_id}")),
        board: data.board.clone(),
    });
    data.board.set(
        job_id,
        JobState::Pending {
            status: "queued",
            account: None,
        },
    );

    match data.queue.enqueue(Job::new(job_id, originator, details)) {
        Ok(position) => {
            data.metrics.record_job();
            info!(job_id = %job_id, position, "Job queued");
            HttpResponse::Accepted().json(serde_json::json!({
                "job_id": job_id,
                "position": position,
            }))
        }
        Err(e) => HttpResponse::ServiceUnavailable().json(serde_json::json!({"error": e.to_string()})),
    }
}

async fn job_status(data: web::Data<AppState>, path: web::Path<Uuid>) -> HttpResponse {
    match data.board.get(&path.into_inner()) {
        Some(state) => HttpResponse::Ok().json(state),
        None => HttpResponse::NotFound().json(serde_json::json!({"error": "unknown job"})),
    }
}

async fn queue(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "processing": data.queue.processing().map(|o| o.label()),
        "waiting": data.queue.depth(),
    }))
}

/// Live points for every account. Runs outside the worker and never moves
/// the rotation cursor.
async fn points(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let (accounts, current) = {
        let store = data.accounts.read().await;
        (store.accounts().to_vec(), store.current_index())
    };
    if accounts.is_empty() {
        return HttpResponse::Ok().json(serde_json::json!({"accounts": [], "total_points": 0}));
    }

    let results = join_all(accounts.iter().map(|acc| data.api.query_quota(acc))).await;
    let mut total_points = 0i64;
    let rows: Vec<serde_json::Value> = accounts
        .iter()
        .zip(results)
        .enumerate()
        .map(|(i, (acc, result))| match result {
            Ok(points) => {
                total_points += points;
                serde_json::json!({"description": acc.description, "current": i == current, "points": points})
            }
            Err(e) => {
                serde_json::json!({"description": acc.description, "current": i == current, "error": e.to_string()})
            }
        })
        .collect();

    HttpResponse::Ok().json(serde_json::json!({
        "accounts": rows,
        "total_points": total_points,
    }))
}

async fn list_accounts(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let store = data.accounts.read().await;
    let rows: Vec<serde_json::Value> = store
        .accounts()
        .iter()
        .enumerate()
        .map(|(i, acc)| {
            serde_json::json!({"description": acc.description, "current": i == store.current_index()})
        })
        .collect();
    HttpResponse::Ok().json(serde_json::json!({"accounts": rows}))
}

async fn add_account(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<NewAccountBody>,
) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let mut store = data.accounts.write().await;
    match store.add(&body.token, &body.user_id, &body.description) {
        Ok(acc) => HttpResponse::Created().json(serde_json::json!({
            "description": acc.description,
            "total": store.len(),
        })),
        Err(e) => account_error(e),
    }
}

async fn edit_account(
    req: HttpRequest,
    data: web::Data<AppState>,
    body: web::Json<EditAccountBody>,
) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let body = body.into_inner();
    let mut store = data.accounts.write().await;
    match store.edit(&body.match_token, &body.match_user_id, body.update) {
        Ok(acc) => HttpResponse::Ok().json(serde_json::json!({"description": acc.description})),
        Err(e) => account_error(e),
    }
}

async fn remove_account(
    req: HttpRequest,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let description = path.into_inner();
    let mut store = data.accounts.write().await;
    match store.remove(&description) {
        Ok(removed) => HttpResponse::Ok().json(serde_json::json!({
            "removed": removed,
            "remaining": store.len(),
        })),
        Err(e) => account_error(e),
    }
}

async fn reload_accounts(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    if !is_owner(&req, &data) {
        return forbidden();
    }
    let mut store = data.accounts.write().await;
    let loaded = store.reload();
    HttpResponse::Ok().json(serde_json::json!({"loaded": loaded, "total": store.len()}))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .route("/generate", web::post().to(generate))
        .route("/jobs/{id}", web::get().to(job_status))
        .route("/queue", web::get().to(queue))
        .route("/points", web::get().to(points))
        .route("/accounts", web::get().to(list_accounts))
        .route("/accounts", web::post().to(add_account))
        .route("/accounts", web::put().to(edit_account))
        .route("/accounts/reload", web::post().to(reload_accounts))
        .route("/accounts/{description}", web::delete().to(remove_account));
}

pub async fn run(state: AppState, port: u16) -> std::io::Result<()> {
    let state = web::Data::new(state);
    let addr = ("0.0.0.0", port);

    info!(port, "Starting HTTP server");

    HttpServer::new(move || App::new().app_data(state.clone()).configure(routes))
        .bind(addr)?
        .run()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{Account, AccountStore};
    use crate::error::PipelineError;
    use actix_web::{http::StatusCode, test};

    struct StaticQuota;

    #[async_trait]
    impl ImageApi for StaticQuota {
        async fn submit(
            &self,
            _: &crate::upstream::GenerationRequest,
            _: &Account,
        ) -> Result<String, PipelineError> {
            Err(PipelineError::Upstream("not used".into()))
        }

        async fn poll_status(&self, _: &str, _: &Account) -> Result<Vec<String>, PipelineError> {
            Err(PipelineError::Timeout)
        }

        async fn query_quota(&self, account: &Account) -> Result<i64, PipelineError> {
            match account.token.as_str() {
                "tok-a" => Ok(1200),
                _ => Err(PipelineError::Upstream("token expired".into())),
            }
        }
    }

    fn state(dir: &std::path::Path) -> (web::Data<AppState>, crate::worker::JobReceiver) {
        let path = dir.join("accounts.json");
        std::fs::write(
            &path,
            serde_json::json!([
                {"token": "tok-a", "userId": "1", "description": "A"},
                {"token": "tok-b", "userId": "2", "description": "B"}
            ])
            .to_string(),
        )
        .unwrap();
        let (queue, rx) = GenerationQueue::new();
        let state = AppState {
            queue,
            accounts: AccountStore::open(path).into_shared(),
            api: Arc::new(StaticQuota),
            metrics: Arc::new(Metrics::new()),
            board: JobBoard::default(),
            owner_token: "owner".into(),
        };
        (web::Data::new(state), rx)
    }

    #[actix_web::test]
    async fn generate_queues_job_and_reports_it() {
        let temp = tempfile::tempdir().unwrap();
        let (data, _rx) = state(temp.path());
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/generate")
            .set_json(serde_json::json!({"prompt": "a cat", "aspect_ratio": "16:9"}))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["position"], 1);

        let req = test::TestRequest::get()
            .uri(&format!("/jobs/{}", resp["job_id"].as_str().unwrap()))
            .to_request();
        let job: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(job["status"], "queued");
        assert_eq!(data.queue.depth(), 1);
    }

    #[actix_web::test]
    async fn generate_rejects_out_of_range_guidance() {
        let temp = tempfile::tempdir().unwrap();
        let (data, _rx) = state(temp.path());
        let app = test::init_service(App::new().app_data(data).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/generate")
            .set_json(serde_json::json!({"prompt": "a cat", "guidance_scale": 12.0}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn admin_routes_require_owner_token() {
        let temp = tempfile::tempdir().unwrap();
        let (data, _rx) = state(temp.path());
        let app = test::init_service(App::new().app_data(data).configure(routes)).await;

        let req = test::TestRequest::get().uri("/points").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::FORBIDDEN);

        let req = test::TestRequest::get()
            .uri("/points")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .to_request();
        let resp: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp["total_points"], 1200);
        assert_eq!(resp["accounts"][0]["current"], true);
        assert_eq!(resp["accounts"][1]["error"], "upstream error: token expired");
    }

    #[actix_web::test]
    async fn account_crud_maps_errors_to_status_codes() {
        let temp = tempfile::tempdir().unwrap();
        let (data, _rx) = state(temp.path());
        let app = test::init_service(App::new().app_data(data.clone()).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/accounts")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .set_json(serde_json::json!({"token": "tok-a", "user_id": "9"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/accounts")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .set_json(serde_json::json!({"token": "tok-c", "user_id": "3", "description": "C"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);

        let req = test::TestRequest::put()
            .uri("/accounts")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .set_json(serde_json::json!({
                "match_token": "tok-c", "match_user_id": "3",
                "token": "tok-c2", "user_id": "33", "description": "C2"
            }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        let req = test::TestRequest::delete()
            .uri("/accounts/missing")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::delete()
            .uri("/accounts/C2")
            .insert_header((AUTHORIZATION, "Bearer owner"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(data.accounts.read().await.len(), 2);
    }

    fn failed(reason: &str) -> JobState {
        JobState::Done(JobOutcome::Failed {
            reason: reason.to_string(),
        })
    }

    #[::core::prelude::v1::test]
    fn job_board_drops_oldest_finished_outcomes() {
        let board = JobBoard::with_capacity(2);
        let queued = Uuid::new_v4();
        board.set(
            queued,
            JobState::Pending {
                status: "queued",
                account: None,
            },
        );
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (n, id) in ids.iter().enumerate() {
            board.set(*id, failed(&format!("job {n}")));
        }

        assert!(board.get(&ids[0]).is_none());
        assert!(board.get(&ids[1]).is_some());
        assert!(board.get(&ids[2]).is_some());
        assert!(matches!(board.get(&queued), Some(JobState::Pending { .. })));
    }

    #[::core::prelude::v1::test]
    fn job_board_keeps_final_state_of_running_job() {
        let board = JobBoard::with_capacity(1);
        let id = Uuid::new_v4();
        board.set(
            id,
            JobState::Pending {
                status: "processing",
                account: Some("A".into()),
            },
        );
        board.set(id, failed("boom"));

        assert!(matches!(board.get(&id), Some(JobState::Done(_))));
    }
}
