//! Application configuration loaded from environment variables.
//!
//! Required: `BOT_TOKEN`
//! Optional: `POINTS_PER_IMAGE`, `API_BASE_URL`, `ACCOUNTS_FILE`,
//!           `PROMPT_CACHE_FILE`, `HTTP_PORT`, `HTTP_TIMEOUT_SECS`

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_BASE_URL: &str = "https://api.vmoscloud.com/vcpcloud/api";

/// Application configuration for the generation backend.
#[derive(Clone)]
pub struct AppConfig {
    /// Bot credential; also guards the owner-only HTTP routes.
    pub bot_token: String,
    /// Minimum remaining points an account needs to accept a job.
    pub points_per_image: i64,
    /// Base URL of the image-generation service.
    pub api_base_url: String,
    /// JSON array of upstream accounts.
    pub accounts_file: PathBuf,
    /// JSON object mapping prompt fingerprints to image URLs.
    pub prompt_cache_file: PathBuf,
    /// HTTP server port.
    pub http_port: u16,
    /// Transport timeout for every outbound HTTP request.
    pub http_timeout: Duration,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let bot_token = std::env::var("BOT_TOKEN").context("BOT_TOKEN env var must be set")?;
        anyhow::ensure!(!bot_token.trim().is_empty(), "BOT_TOKEN must not be empty");

        let points_per_image = match std::env::var("POINTS_PER_IMAGE") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid POINTS_PER_IMAGE: {v}"))?,
            Err(_) => 1000,
        };

        let api_base_url = std::env::var("API_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_API_BASE_URL.into())
            .trim_end_matches('/')
            .to_string();

        let accounts_file = expand_path("ACCOUNTS_FILE", "accounts.json");
        let prompt_cache_file = expand_path("PROMPT_CACHE_FILE", "prompt_cache.json");

        let http_port = std::env::var("HTTP_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let http_timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(180);

        Ok(Self {
            bot_token,
            points_per_image,
            api_base_url,
            accounts_file,
            prompt_cache_file,
            http_port,
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }
}

fn expand_path(var: &str, default: &str) -> PathBuf {
    let raw = std::env::var(var).unwrap_or_else(|_| default.into());
    PathBuf::from(shellexpand::tilde(&raw).to_string())
}
