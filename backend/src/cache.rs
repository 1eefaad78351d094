//! Write-through prompt cache: fingerprint -> image URL.
//!
//! Entries never expire. The whole map is rewritten on every insert; a failed
//! write is logged and the in-memory entry is kept.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

pub struct PromptCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl PromptCache {
    /// Load the cache file. A missing or unreadable file starts an empty cache.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_entries(&path);
        Self { path, entries }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&str> {
        self.entries.get(fingerprint).map(String::as_str)
    }

    pub fn set(&mut self, fingerprint: impl Into<String>, url: impl Into<String>) {
        self.entries.insert(fingerprint.into(), url.into());
        if let Err(e) = self.save() {
            error!(path = %self.path.display(), error = %e, "Failed to write prompt cache");
        }
    }

    /// Number of cached prompts.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> anyhow::Result<()> {
        std::fs::write(&self.path, serde_json::to_string_pretty(&self.entries)?)?;
        Ok(())
    }
}

fn load_entries(path: &Path) -> BTreeMap<String, String> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Prompt cache unreadable, starting empty");
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "Prompt cache malformed, starting empty");
        BTreeMap::new()
    })
}
