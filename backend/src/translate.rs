//! Best-effort text translation and URL shortening.
//!
//! Neither is allowed to fail a job: every error falls back to the input.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

const TRANSLATE_URL: &str = "https://translate.googleapis.com/translate_a/single";
const SHORTEN_URL: &str = "http://tinyurl.com/api-create.php";

/// Languages the generation service understands without translation.
const NATIVE_LANGUAGES: [&str; 3] = ["en", "zh-cn", "zh-tw"];

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` to canonical English, or return it unchanged.
    async fn canonicalize(&self, text: &str) -> String;
}

#[async_trait]
pub trait UrlShortener: Send + Sync {
    /// Shorten `url`, or return it unchanged.
    async fn shorten(&self, url: &str) -> String;
}

/// Translator backed by the public Google Translate endpoint.
#[derive(Clone)]
pub struct GoogleTranslator {
    http: reqwest::Client,
    endpoint: String,
}

impl GoogleTranslator {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoint(http, TRANSLATE_URL)
    }

    /// Client that sends translation requests to `endpoint`.
    pub fn with_endpoint(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    async fn translate(&self, text: &str) -> anyhow::Result<Option<String>> {
        let body: Value = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("client", "gtx"),
                ("sl", "auto"),
                ("tl", "en"),
                ("dt", "t"),
                ("q", text),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let (language, translated) = parse_translation(&body)
            .ok_or_else(|| anyhow::anyhow!("unexpected translation response shape"))?;
        if NATIVE_LANGUAGES.contains(&language.as_str()) {
            return Ok(None);
        }
        Ok(Some(translated))
    }
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn canonicalize(&self, text: &str) -> String {
        match self.translate(text).await {
            Ok(Some(translated)) if !translated.is_empty() => translated,
            Ok(_) => text.to_string(),
            Err(e) => {
                debug!(error = %e, "Translation failed, using original text");
                text.to_string()
            }
        }
    }
}

/// Extract `(detected_language, translated_text)` from a `translate_a/single`
/// response: `[[["segment", "source", ..], ..], null, "lang", ..]`.
pub fn parse_translation(body: &Value) -> Option<(String, String)> {
    let segments = body.get(0)?.as_array()?;
    let translated: String = segments
        .iter()
        .filter_map(|seg| seg.get(0).and_then(Value::as_str))
        .collect();
    let language = body.get(2)?.as_str()?.to_ascii_lowercase();
    Some((language, translated))
}

#[derive(Clone)]
pub struct TinyUrlShortener {
    http: reqwest::Client,
    endpoint: String,
}

impl TinyUrlShortener {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_endpoint(http, SHORTEN_URL)
    }

    /// Client that sends shortening requests to `endpoint`.
    pub fn with_endpoint(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl UrlShortener for TinyUrlShortener {
    async fn shorten(&self, url: &str) -> String {
        let result = async {
            let resp = self.http.get(&self.endpoint).query(&[("url", url)]).send().await?;
            if !resp.status().is_success() {
                anyhow::bail!("HTTP {}", resp.status());
            }
            Ok::<_, anyhow::Error>(resp.text().await?.trim().to_string())
        }
        .await;

        match result {
            Ok(short) if !short.is_empty() => short,
            Ok(_) => url.to_string(),
            Err(e) => {
                debug!(error = %e, "URL shortening failed, using original URL");
                url.to_string()
            }
        }
    }
}
