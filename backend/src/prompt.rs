//! Prompt parameters, normalization, style enhancement and cache fingerprints.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::error::ValidationError;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static EMPTY_SEGMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s*,").expect("valid regex"));

pub const MIN_GUIDANCE_SCALE: f64 = 1.0;
pub const MAX_GUIDANCE_SCALE: f64 = 10.0;
pub const MIN_SEED: i64 = -1;
pub const MAX_SEED: i64 = 2_147_483_647;

/// Art style chosen by the requester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    None,
    Anime,
    Realistic,
    Cyberpunk,
    Fantasy,
    OilPainting,
}

impl Style {
    pub fn keywords(self) -> &'static str {
        match self {
            Style::None => "best quality, masterpiece",
            Style::Anime => {
                "anime artwork, anime style, key visual, vibrant, studio anime, highly detailed"
            }
            Style::Realistic => {
                "photorealistic, realistic, 8k, ultra-detailed, professional photography, sharp focus, cinematic photo"
            }
            Style::Cyberpunk => {
                "cyberpunk style, neon lights, futuristic city, dystopian, cinematic, blade runner"
            }
            Style::Fantasy => {
                "fantasy art, magical, epic, enchanting, detailed matte painting, dungeons and dragons"
            }
            Style::OilPainting => {
                "oil painting, masterpiece, textured, brush strokes, impressionism"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[default]
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "16:9")]
    Widescreen,
    #[serde(rename = "9:16")]
    Story,
}

impl AspectRatio {
    /// Pixel size string the generation service expects.
    pub fn size(self) -> &'static str {
        match self {
            AspectRatio::Square => "1024x1024",
            AspectRatio::Portrait => "768x1024",
            AspectRatio::Landscape => "1024x768",
            AspectRatio::Widescreen => "1344x768",
            AspectRatio::Story => "768x1344",
        }
    }
}

/// Validated generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptDetails {
    pub prompt: String,
    pub style: Style,
    pub negative_prompt: Option<String>,
    pub size: String,
    pub guidance_scale: f64,
    pub seed: i64,
}

impl PromptDetails {
    pub fn new(
        prompt: impl Into<String>,
        style: Style,
        aspect_ratio: AspectRatio,
        negative_prompt: Option<String>,
        guidance_scale: f64,
        seed: i64,
    ) -> Result<Self, ValidationError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if !(MIN_GUIDANCE_SCALE..=MAX_GUIDANCE_SCALE).contains(&guidance_scale) {
            return Err(ValidationError::GuidanceScale(guidance_scale));
        }
        if !(MIN_SEED..=MAX_SEED).contains(&seed) {
            return Err(ValidationError::Seed(seed));
        }
        let negative_prompt = negative_prompt.filter(|n| !n.trim().is_empty());
        Ok(Self {
            prompt,
            style,
            negative_prompt,
            size: aspect_ratio.size().to_string(),
            guidance_scale,
            seed,
        })
    }

    /// Style-free text the cache fingerprint is built from, before translation.
    pub fn cache_source(&self) -> String {
        let mut parts = vec![clean_prompt(&self.prompt)];
        if let Some(negative) = &self.negative_prompt {
            parts.push(format!("| negative prompt: {}", clean_prompt(negative)));
        }
        parts.join(" ")
    }

    /// Prompt actually sent upstream, before translation.
    pub fn enhanced(&self) -> String {
        enhance_prompt(
            &clean_prompt(&self.prompt),
            self.style,
            self.negative_prompt.as_deref(),
        )
    }

    /// Cache key for a canonical (translated) [`PromptDetails::cache_source`].
    pub fn fingerprint(&self, canonical: &str) -> String {
        // Debug keeps the trailing ".0" on whole numbers so keys stay stable.
        format!(
            "{canonical}_{}_{:?}_{}",
            self.size, self.guidance_scale, self.seed
        )
    }
}

/// Collapse runs of whitespace and trim.
pub fn clean_prompt(prompt: &str) -> String {
    WHITESPACE.replace_all(prompt.trim(), " ").into_owned()
}

pub fn enhance_prompt(prompt: &str, style: Style, negative_prompt: Option<&str>) -> String {
    let keywords = style.keywords();
    let enhanced = if keywords.is_empty() {
        prompt.to_string()
    } else {
        format!("{prompt}, {keywords}")
    };
    let full = match negative_prompt {
        Some(negative) => format!("{enhanced} | negative prompt: {}", clean_prompt(negative)),
        None => enhanced,
    };
    EMPTY_SEGMENT
        .replace_all(&full, ",")
        .trim_matches(|c| c == ',' || c == ' ')
        .to_string()
}
