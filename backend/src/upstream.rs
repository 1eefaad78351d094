//! Client for the upstream image-generation service.
//!
//! Every response is a JSON envelope `{code, msg, data}`; a call succeeds only
//! when the HTTP status is 200, `code` is 200 and `data` is present.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::accounts::Account;
use crate::error::PipelineError;

/// Delay before each status poll.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Status polls before a job is declared timed out.
pub const POLL_MAX_ATTEMPTS: u32 = 90;

const APP_VERSION: &str = "2008500";
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Operations the worker needs from the generation service.
#[async_trait]
pub trait ImageApi: Send + Sync {
    /// Submit a generation job and return its task id.
    async fn submit(&self, request: &GenerationRequest, account: &Account) -> Result<String, PipelineError>;

    /// Poll until the task reports its images or the poll budget runs out.
    async fn poll_status(&self, task_id: &str, account: &Account) -> Result<Vec<String>, PipelineError>;

    /// Remaining points on `account`.
    async fn query_quota(&self, account: &Account) -> Result<i64, PipelineError>;
}

/// Body of the submit call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub size: String,
    pub seed: i64,
    pub guidance_scale: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: POLL_INTERVAL,
            max_attempts: POLL_MAX_ATTEMPTS,
        }
    }
}

/// Result of one status poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollAttempt {
    Ready(Vec<String>),
    Pending,
}

/// Run `attempt` up to `policy.max_attempts` times, sleeping `policy.interval`
/// before each one. `Pending` keeps polling; an error aborts immediately.
pub async fn poll_with_budget<F, Fut>(policy: PollPolicy, mut attempt: F) -> Result<Vec<String>, PipelineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollAttempt, PipelineError>>,
{
    for n in 1..=policy.max_attempts {
        tokio::time::sleep(policy.interval).await;
        if let PollAttempt::Ready(images) = attempt(n).await? {
            return Ok(images);
        }
    }
    Err(PipelineError::Timeout)
}

#[derive(Deserialize, Debug)]
struct Envelope {
    code: Option<i64>,
    msg: Option<String>,
    data: Option<Value>,
}

/// Unwrap a response envelope into its `data` payload.
fn unwrap_envelope(status: u16, body: &str) -> Result<Value, PipelineError> {
    let fallback = || PipelineError::Upstream(format!("HTTP {status}"));
    let envelope: Envelope = serde_json::from_str(body).map_err(|_| fallback())?;
    match envelope {
        Envelope {
            code: Some(200),
            data: Some(data),
            ..
        } if status == 200 && !data.is_null() => Ok(data),
        Envelope { msg: Some(msg), .. } if !msg.is_empty() => Err(PipelineError::Upstream(msg)),
        _ => Err(fallback()),
    }
}

fn parse_submit(status: u16, body: &str) -> Result<String, PipelineError> {
    let data = unwrap_envelope(status, body)?;
    match data.get("taskId") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(PipelineError::Upstream("response is missing taskId".into())),
    }
}

fn parse_status(status: u16, body: &str) -> Result<PollAttempt, PipelineError> {
    let Ok(data) = unwrap_envelope(status, body) else {
        return Ok(PollAttempt::Pending);
    };
    // `returnImage` is a JSON-encoded array inside a string.
    let images: Vec<Value> = match data.get("returnImage") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|e| PipelineError::Upstream(format!("malformed returnImage: {e}")))?,
        Some(Value::Array(items)) => items.clone(),
        Some(other) => {
            return Err(PipelineError::Upstream(format!(
                "malformed returnImage: {other}"
            )));
        }
    };
    Ok(PollAttempt::Ready(
        images
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    ))
}

fn parse_quota(status: u16, body: &str) -> Result<i64, PipelineError> {
    let data = unwrap_envelope(status, body)?;
    data.get("remainingPoints")
        .and_then(Value::as_i64)
        .ok_or_else(|| PipelineError::Upstream("response is missing remainingPoints".into()))
}

/// HTTP client for the generation service.
#[derive(Clone)]
pub struct VmosClient {
    http: reqwest::Client,
    base_url: String,
    poll: PollPolicy,
}

impl VmosClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            poll: PollPolicy::default(),
        }
    }

    /// Override the status-poll cadence.
    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn headers(account: &Account) -> Result<HeaderMap, PipelineError> {
        let value = |v: &str| {
            HeaderValue::from_str(v)
                .map_err(|_| PipelineError::Upstream("account credential is not a valid header".into()))
        };
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        headers.insert(HeaderName::from_static("token"), value(&account.token)?);
        headers.insert(HeaderName::from_static("userid"), value(&account.user_id)?);
        headers.insert(HeaderName::from_static("clienttype"), HeaderValue::from_static("web"));
        headers.insert(HeaderName::from_static("appversion"), HeaderValue::from_static(APP_VERSION));
        headers.insert(
            HeaderName::from_static("requestsource"),
            HeaderValue::from_static("wechat-miniapp"),
        );
        headers.insert(HeaderName::from_static("suppliertype"), HeaderValue::from_static("0"));
        Ok(headers)
    }

    async fn read(resp: reqwest::Response) -> Result<(u16, String), reqwest::Error> {
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok((status, body))
    }
}

fn transport(e: reqwest::Error) -> PipelineError {
    PipelineError::Upstream(format!("request failed: {e}"))
}

#[async_trait]
impl ImageApi for VmosClient {
    #[instrument(skip_all, fields(account = %account.description))]
    async fn submit(&self, request: &GenerationRequest, account: &Account) -> Result<String, PipelineError> {
        let resp = self
            .http
            .post(format!("{}/images/generation", self.base_url))
            .headers(Self::headers(account)?)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = Self::read(resp).await.map_err(transport)?;
        parse_submit(status, &body)
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    async fn poll_status(&self, task_id: &str, account: &Account) -> Result<Vec<String>, PipelineError> {
        let url = format!("{}/images/status/{task_id}", self.base_url);
        let headers = Self::headers(account)?;
        poll_with_budget(self.poll, |attempt| {
            let req = self.http.get(&url).headers(headers.clone());
            async move {
                match req.send().await {
                    Ok(resp) => match Self::read(resp).await {
                        Ok((status, body)) => parse_status(status, &body),
                        Err(e) => {
                            debug!(attempt, error = %e, "Status body unreadable");
                            Ok(PollAttempt::Pending)
                        }
                    },
                    Err(e) => {
                        debug!(attempt, error = %e, "Status poll failed");
                        Ok(PollAttempt::Pending)
                    }
                }
            }
        })
        .await
    }

    #[instrument(skip_all, fields(account = %account.description))]
    async fn query_quota(&self, account: &Account) -> Result<i64, PipelineError> {
        let resp = self
            .http
            .post(format!("{}/imagesUser/userInfo", self.base_url))
            .headers(Self::headers(account)?)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = Self::read(resp).await.map_err(transport)?;
        parse_quota(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const FAST_POLL: PollPolicy = PollPolicy {
        interval: Duration::from_millis(5),
        max_attempts: 4,
    };

    fn account() -> Account {
        Account {
            token: "tok-a".into(),
            user_id: "42".into(),
            description: "A".into(),
        }
    }

    /// Serve `configure` on an ephemeral local port and return its base URL.
    async fn serve<F>(configure: F) -> String
    where
        F: Fn(&mut web::ServiceConfig) + Clone + Send + 'static,
    {
        let server = HttpServer::new(move || App::new().configure(configure.clone()))
            .workers(1)
            .disable_signals()
            .bind(("127.0.0.1", 0))
            .unwrap();
        let addr = server.addrs()[0];
        actix_web::rt::spawn(server.run());
        format!("http://{addr}")
    }

    fn header<'a>(req: &'a HttpRequest, name: &str) -> &'a str {
        req.headers().get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
    }

    fn authorized(req: &HttpRequest) -> bool {
        header(req, "token") == "tok-a"
            && header(req, "userid") == "42"
            && header(req, "appversion") == APP_VERSION
            && header(req, "requestsource") == "wechat-miniapp"
    }

    async fn fake_submit(req: HttpRequest, body: web::Json<serde_json::Value>) -> HttpResponse {
        if !authorized(&req) {
            return HttpResponse::Ok().json(json!({"code": 401, "msg": "bad credentials"}));
        }
        let body = body.into_inner();
        if body != json!({"prompt": "a cat", "size": "1024x1024", "seed": -1, "guidance_scale": 7.5}) {
            return HttpResponse::Ok().json(json!({"code": 400, "msg": format!("unexpected body {body}")}));
        }
        HttpResponse::Ok().json(json!({"code": 200, "data": {"taskId": "t-9"}}))
    }

    async fn fake_quota(req: HttpRequest) -> HttpResponse {
        if !authorized(&req) {
            return HttpResponse::Ok().json(json!({"code": 401, "msg": "bad credentials"}));
        }
        HttpResponse::Ok().json(json!({"code": 200, "data": {"remainingPoints": 1500}}))
    }

    #[test]
    fn submit_returns_task_id() {
        let body = json!({"code": 200, "data": {"taskId": "t-1"}}).to_string();
        assert_eq!(parse_submit(200, &body), Ok("t-1".to_string()));
        let numeric = json!({"code": 200, "data": {"taskId": 42}}).to_string();
        assert_eq!(parse_submit(200, &numeric), Ok("42".to_string()));
    }

    #[test]
    fn submit_surfaces_service_message_or_status() {
        let body = json!({"code": 500, "msg": "insufficient points"}).to_string();
        assert_eq!(
            parse_submit(200, &body),
            Err(PipelineError::Upstream("insufficient points".into()))
        );
        assert_eq!(
            parse_submit(502, "<html>bad gateway</html>"),
            Err(PipelineError::Upstream("HTTP 502".into()))
        );
        let missing = json!({"code": 200, "data": {}}).to_string();
        assert!(matches!(parse_submit(200, &missing), Err(PipelineError::Upstream(_))));
    }

    #[test]
    fn status_decodes_embedded_image_list() {
        let body = json!({
            "code": 200,
            "data": {"returnImage": "[\"https://x/1.png\", \"https://x/2.png\"]"}
        })
        .to_string();
        assert_eq!(
            parse_status(200, &body),
            Ok(PollAttempt::Ready(vec![
                "https://x/1.png".to_string(),
                "https://x/2.png".to_string()
            ]))
        );
    }

    #[test]
    fn status_not_ready_keeps_polling() {
        let body = json!({"code": 202, "msg": "processing"}).to_string();
        assert_eq!(parse_status(200, &body), Ok(PollAttempt::Pending));
        assert_eq!(parse_status(503, ""), Ok(PollAttempt::Pending));
    }

    #[test]
    fn status_with_broken_image_list_is_an_error() {
        let body = json!({"code": 200, "data": {"returnImage": "[oops"}}).to_string();
        assert!(matches!(parse_status(200, &body), Err(PipelineError::Upstream(_))));
    }

    #[test]
    fn quota_requires_remaining_points() {
        let body = json!({"code": 200, "data": {"remainingPoints": 1500}}).to_string();
        assert_eq!(parse_quota(200, &body), Ok(1500));
        let missing = json!({"code": 200, "data": {"nickname": "x"}}).to_string();
        assert!(matches!(parse_quota(200, &missing), Err(PipelineError::Upstream(_))));
        let denied = json!({"code": 401, "msg": "token expired"}).to_string();
        assert_eq!(
            parse_quota(200, &denied),
            Err(PipelineError::Upstream("token expired".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_after_exact_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = calls.clone();
        let result = poll_with_budget(PollPolicy::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(PollAttempt::Pending) }
        })
        .await;

        assert_eq!(result, Err(PipelineError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), POLL_MAX_ATTEMPTS);
        let budget = POLL_INTERVAL * POLL_MAX_ATTEMPTS;
        assert!(started.elapsed() >= budget);
        assert!(started.elapsed() < budget + POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_as_soon_as_ready() {
        let result = poll_with_budget(PollPolicy::default(), |n| async move {
            if n == 3 {
                Ok(PollAttempt::Ready(vec!["https://x/1.png".into()]))
            } else {
                Ok(PollAttempt::Pending)
            }
        })
        .await;
        assert_eq!(result, Ok(vec!["https://x/1.png".to_string()]));
    }

    #[actix_web::test]
    async fn submit_and_quota_send_credentials_and_body() {
        let base = serve(|cfg| {
            cfg.route("/images/generation", web::post().to(fake_submit))
                .route("/imagesUser/userInfo", web::post().to(fake_quota));
        })
        .await;
        let client = VmosClient::new(reqwest::Client::new(), base);
        let request = GenerationRequest {
            prompt: "a cat".into(),
            size: "1024x1024".into(),
            seed: -1,
            guidance_scale: 7.5,
        };

        assert_eq!(client.submit(&request, &account()).await, Ok("t-9".to_string()));
        assert_eq!(client.query_quota(&account()).await, Ok(1500));

        let stranger = Account {
            token: "tok-z".into(),
            ..account()
        };
        assert_eq!(
            client.query_quota(&stranger).await,
            Err(PipelineError::Upstream("bad credentials".into()))
        );
    }

    #[actix_web::test]
    async fn poll_keeps_going_through_errors_until_images_arrive() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let base = serve(move |cfg| {
            let counter = counter.clone();
            cfg.route(
                "/images/status/{id}",
                web::get().to(move |path: web::Path<String>| {
                    let counter = counter.clone();
                    async move {
                        match counter.fetch_add(1, Ordering::SeqCst) {
                            0 => HttpResponse::BadGateway().body("upstream down"),
                            1 => HttpResponse::Ok().json(json!({"code": 202, "msg": "processing"})),
                            _ => HttpResponse::Ok().json(json!({
                                "code": 200,
                                "data": {"returnImage": format!("[\"https://x/{}.png\"]", path.into_inner())}
                            })),
                        }
                    }
                }),
            );
        })
        .await;
        let client = VmosClient::new(reqwest::Client::new(), base).with_poll_policy(FAST_POLL);

        let images = client.poll_status("t-9", &account()).await;

        assert_eq!(images, Ok(vec!["https://x/t-9.png".to_string()]));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_service_counts_as_pending_until_timeout() {
        let client = VmosClient::new(reqwest::Client::new(), "http://127.0.0.1:1").with_poll_policy(FAST_POLL);
        assert_eq!(client.poll_status("t-1", &account()).await, Err(PipelineError::Timeout));
    }

    #[tokio::test]
    async fn unreachable_service_fails_submit_and_quota() {
        let client = VmosClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let request = GenerationRequest {
            prompt: "a cat".into(),
            size: "1024x1024".into(),
            seed: -1,
            guidance_scale: 7.5,
        };
        assert!(matches!(client.submit(&request, &account()).await, Err(PipelineError::Upstream(_))));
        assert!(matches!(client.query_quota(&account()).await, Err(PipelineError::Upstream(_))));
    }
}
