//! Persistent ban list
//!
//! A set of `(subject, type)` pairs stored as a JSON array. The list outlives
//! any single room: it is loaded when a host starts (if requested) and
//! written back after every change.

use std::collections::BTreeSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::BanType;

/// A single ban
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BanListEntry {
    /// Account username or textual IP address
    pub subject: String,
    pub ban_type: BanType,
}

impl BanListEntry {
    pub fn account(username: impl Into<String>) -> Self {
        Self {
            subject: username.into(),
            ban_type: BanType::Account,
        }
    }

    pub fn ip(addr: IpAddr) -> Self {
        Self {
            subject: addr.to_string(),
            ban_type: BanType::Ip,
        }
    }
}

/// Ban list load/store errors
#[derive(Debug, Error)]
pub enum BanListError {
    #[error("ban list IO error: {0}")]
    Io(#[from] io::Error),

    #[error("ban list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The ban set, optionally backed by a file
#[derive(Debug, Default)]
pub struct BanList {
    entries: BTreeSet<BanListEntry>,
    path: Option<PathBuf>,
}

impl BanList {
    /// Empty, in-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty list that will be written to `path` on the next save
    ///
    /// Used when a room is created without loading the previous list.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            entries: BTreeSet::new(),
            path: Some(path.into()),
        }
    }

    /// Load the list stored at `path`; a missing file is an empty list
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, BanListError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<BanListEntry>>(&bytes)?
                .into_iter()
                .collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} ban entries from {}", entries.len(), path.display());
        Ok(Self {
            entries,
            path: Some(path),
        })
    }

    /// Write the list to its backing file, if any
    ///
    /// Writes a sibling temporary file first and renames it into place.
    pub async fn save(&self) -> Result<(), BanListError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries: Vec<&BanListEntry> = self.entries.iter().collect();
        let json = serde_json::to_vec_pretty(&entries)?;
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved {} ban entries to {}", self.entries.len(), path.display());
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns false if the entry was already present
    pub fn insert(&mut self, entry: BanListEntry) -> bool {
        self.entries.insert(entry)
    }

    /// Returns false if the entry was not present
    pub fn remove(&mut self, entry: &BanListEntry) -> bool {
        self.entries.remove(entry)
    }

    pub fn contains(&self, entry: &BanListEntry) -> bool {
        self.entries.contains(entry)
    }

    /// True if either the account or the address is banned
    pub fn is_banned(&self, account: Option<&str>, ip: IpAddr) -> bool {
        let account_banned = account
            .map(|name| self.contains(&BanListEntry::account(name)))
            .unwrap_or(false);
        account_banned || self.contains(&BanListEntry::ip(ip))
    }

    /// Snapshot in sorted order
    pub fn entries(&self) -> Vec<BanListEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
