//! Upstream account store with a round-robin cursor.
//!
//! Accounts live in a flat JSON array; every mutation rewrites the whole file
//! and then resets the cursor, the same as a fresh [`AccountStore::reload`].

use serde::{de, Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::AccountError;

/// Store shared between the worker and the administrative routes.
pub type SharedAccounts = Arc<RwLock<AccountStore>>;

/// Credentials for one upstream service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub token: String,
    #[serde(rename = "userId", deserialize_with = "string_or_number")]
    pub user_id: String,
    #[serde(default)]
    pub description: String,
}

/// Replacement fields for [`AccountStore::edit`].
#[derive(Debug, Clone, Deserialize)]
pub struct AccountUpdate {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub description: String,
}

/// Ordered account collection plus the index of the account to try next.
pub struct AccountStore {
    path: PathBuf,
    accounts: Vec<Account>,
    current_index: usize,
}

impl AccountStore {
    /// Open the store at `path` and load it. A failed load leaves the store
    /// empty; check [`AccountStore::is_empty`] before starting the worker.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            path: path.into(),
            accounts: Vec::new(),
            current_index: 0,
        };
        store.reload();
        store
    }

    /// Wrap the store for sharing between the worker and HTTP handlers.
    pub fn into_shared(self) -> SharedAccounts {
        Arc::new(RwLock::new(self))
    }

    /// Re-read the backing file and reset the cursor to 0.
    ///
    /// Returns `false` and empties the collection when the file is missing,
    /// unreadable, empty, or not a JSON array of accounts.
    pub fn reload(&mut self) -> bool {
        self.current_index = 0;
        match read_accounts(&self.path) {
            Ok(accounts) if !accounts.is_empty() => {
                info!(count = accounts.len(), path = %self.path.display(), "Loaded accounts");
                self.accounts = accounts;
                true
            }
            Ok(_) => {
                error!(path = %self.path.display(), "Accounts file is empty");
                self.accounts.clear();
                false
            }
            Err(AccountError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                error!(path = %self.path.display(), "Accounts file not found");
                self.accounts.clear();
                false
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read accounts file");
                self.accounts.clear();
                false
            }
        }
    }

    /// All accounts in file order.
    pub fn accounts(&self) -> &[Account] {
        &self.accounts
    }

    /// Number of loaded accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// True when no accounts are loaded.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Index of the account the next job will try first.
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Account under the cursor, or `None` when the store is empty.
    pub fn current_account(&self) -> Option<&Account> {
        self.accounts.get(self.current_index)
    }

    /// Move the cursor to the next account, wrapping at the end.
    pub fn advance(&mut self) -> Option<&Account> {
        if self.accounts.is_empty() {
            return None;
        }
        self.current_index = (self.current_index + 1) % self.accounts.len();
        let account = &self.accounts[self.current_index];
        warn!(
            index = self.current_index,
            account = %account.description,
            "Switched to next account"
        );
        Some(account)
    }

    /// Append a new account. Rejected if the token or the user id is
    /// already present anywhere in the collection.
    pub fn add(
        &mut self,
        token: &str,
        user_id: &str,
        description: &str,
    ) -> Result<Account, AccountError> {
        let token = token.trim();
        let user_id = user_id.trim();
        if self
            .accounts
            .iter()
            .any(|acc| acc.token == token || acc.user_id == user_id)
        {
            return Err(AccountError::Duplicate);
        }

        let description = match description.trim() {
            "" => format!("Account #{}", self.accounts.len() + 1),
            d => d.to_string(),
        };
        let account = Account {
            token: token.to_string(),
            user_id: user_id.to_string(),
            description,
        };

        let mut updated = self.accounts.clone();
        updated.push(account.clone());
        self.commit(updated)?;
        info!(account = %account.description, total = self.accounts.len(), "Added account");
        Ok(account)
    }

    /// Overwrite the first account matching `(match_token, match_user_id)`.
    pub fn edit(
        &mut self,
        match_token: &str,
        match_user_id: &str,
        update: AccountUpdate,
    ) -> Result<Account, AccountError> {
        let mut updated = self.accounts.clone();
        let target = updated
            .iter_mut()
            .find(|acc| acc.token == match_token && acc.user_id == match_user_id)
            .ok_or(AccountError::NotFound)?;

        target.token = update.token.trim().to_string();
        target.user_id = update.user_id.trim().to_string();
        target.description = update.description.trim().to_string();
        let edited = target.clone();

        self.commit(updated)?;
        info!(account = %edited.description, "Updated account");
        Ok(edited)
    }

    /// Remove every account whose description equals `description`.
    /// Returns how many were removed.
    pub fn remove(&mut self, description: &str) -> Result<usize, AccountError> {
        let updated: Vec<Account> = self
            .accounts
            .iter()
            .filter(|acc| acc.description != description)
            .cloned()
            .collect();
        let removed = self.accounts.len() - updated.len();
        if removed == 0 {
            return Err(AccountError::NotFound);
        }

        self.commit(updated)?;
        info!(account = %description, removed, remaining = self.accounts.len(), "Removed account");
        Ok(removed)
    }

    /// Persist first so a failed write leaves memory untouched.
    fn commit(&mut self, accounts: Vec<Account>) -> Result<(), AccountError> {
        write_accounts(&self.path, &accounts)?;
        self.accounts = accounts;
        self.current_index = 0;
        Ok(())
    }
}

fn read_accounts(path: &Path) -> Result<Vec<Account>, AccountError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_accounts(path: &Path, accounts: &[Account]) -> Result<(), AccountError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(accounts)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Older files store `userId` as a bare number.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number for userId, got {other}"
        ))),
    }
}
