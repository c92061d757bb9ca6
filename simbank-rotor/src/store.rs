//! Durable phone-number records.
//!
//! Two collaborators share one interface: the local line-oriented file the
//! engine owns, and the operator's external keyed upsert endpoint. Both are
//! idempotent on the card identity; a rotation that re-exposes an already
//! activated card must never create a second record.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::modem::CardIdentity;

/// Keyed upsert of a discovered phone number against a card identity.
#[async_trait]
pub trait NumberStore: Send + Sync {
    async fn save(&self, identity: &CardIdentity, number: &str) -> Result<()>;

    /// Previously stored number for this card, if any. Stores that cannot be
    /// queried (write-only collaborators) return `None`.
    async fn lookup(&self, identity: &CardIdentity) -> Result<Option<String>>;
}

/// Local `number=identity` line file.
pub struct FileNumberStore {
    path: PathBuf,
}

impl FileNumberStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_entries(&self) -> Vec<(String, String)> {
        let raw = tokio::fs::read_to_string(&self.path).await.unwrap_or_default();
        raw.lines()
            .filter_map(|line| {
                let (number, identity) = line.trim().split_once('=')?;
                if number.is_empty() || identity.is_empty() {
                    return None;
                }
                Some((number.to_string(), identity.to_string()))
            })
            .collect()
    }

    async fn write_entries(&self, entries: &[(String, String)]) -> Result<()> {
        let mut raw = String::new();
        for (number, identity) in entries {
            raw.push_str(&format!("{number}={identity}\n"));
        }
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|source| Error::Persistence {
                path: self.path.clone(),
                source,
            })
    }

    /// Drop duplicate lines, keeping the first occurrence of every number
    /// and of every identity. Returns (lines before, lines after).
    pub async fn dedupe(&self) -> Result<(usize, usize)> {
        let entries = self.read_entries().await;
        let before = entries.len();
        let mut seen_numbers = std::collections::HashSet::new();
        let mut seen_identities = std::collections::HashSet::new();
        let cleaned: Vec<(String, String)> = entries
            .into_iter()
            .filter(|(number, identity)| {
                seen_numbers.insert(number.clone()) && seen_identities.insert(identity.clone())
            })
            .collect();
        let after = cleaned.len();
        self.write_entries(&cleaned).await?;
        info!(before, after, path = %self.path.display(), "number file deduplicated");
        Ok((before, after))
    }
}

#[async_trait]
impl NumberStore for FileNumberStore {
    async fn save(&self, identity: &CardIdentity, number: &str) -> Result<()> {
        let mut entries = self.read_entries().await;
        if let Some(entry) = entries.iter_mut().find(|(_, id)| id == identity.as_str()) {
            if entry.0 == number {
                return Ok(());
            }
            debug!(
                identity = %identity,
                old = %entry.0,
                new = number,
                "updating stored number"
            );
            entry.0 = number.to_string();
        } else {
            entries.push((number.to_string(), identity.as_str().to_string()));
        }
        self.write_entries(&entries).await
    }

    async fn lookup(&self, identity: &CardIdentity) -> Result<Option<String>> {
        Ok(self
            .read_entries()
            .await
            .into_iter()
            .find(|(_, id)| id == identity.as_str())
            .map(|(number, _)| number))
    }
}

/// External upsert collaborator over HTTP.
///
/// Write-only: the remote service owns querying and reporting. A failed
/// upsert is surfaced as a persistence error for the caller to log; it never
/// stops the activation pass.
pub struct HttpNumberStore {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpNumberStore {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl NumberStore for HttpNumberStore {
    async fn save(&self, identity: &CardIdentity, number: &str) -> Result<()> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "card_identity": identity.as_str(),
            "phone_number": number,
        }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| Error::Persistence {
            path: PathBuf::from(&self.url),
            source: std::io::Error::other(e),
        })?;
        if !response.status().is_success() {
            warn!(identity = %identity, status = %response.status(), "upsert rejected");
            return Err(Error::Persistence {
                path: PathBuf::from(&self.url),
                source: std::io::Error::other(format!("status {}", response.status())),
            });
        }
        Ok(())
    }

    async fn lookup(&self, _identity: &CardIdentity) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Fan-out store: saves to every backend, succeeds if the primary (first)
/// one does. Secondary failures are logged and swallowed.
pub struct TieredStore {
    stores: Vec<Box<dyn NumberStore>>,
}

impl TieredStore {
    pub fn new(stores: Vec<Box<dyn NumberStore>>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl NumberStore for TieredStore {
    async fn save(&self, identity: &CardIdentity, number: &str) -> Result<()> {
        let mut result = Ok(());
        for (index, store) in self.stores.iter().enumerate() {
            match store.save(identity, number).await {
                Ok(()) => {}
                Err(e) if index == 0 => result = Err(e),
                Err(e) => warn!(identity = %identity, "secondary store failed: {e}"),
            }
        }
        result
    }

    async fn lookup(&self, identity: &CardIdentity) -> Result<Option<String>> {
        for store in &self.stores {
            if let Some(number) = store.lookup(identity).await? {
                return Ok(Some(number));
            }
        }
        Ok(None)
    }
}
