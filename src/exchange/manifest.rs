//! Server-side manifest of synchronizable files.
//!
//! Entries are logical references: existence and content are read on demand,
//! so a file removed after the manifest was built is simply not sent.

use crate::config::FileConfig;
use crate::error::{Result, SyncError};
use crate::exchange::protocol::OfferedFile;
use crate::exchange::registry::validate_identifier;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub identifier: String,
    pub path: PathBuf,
}

impl SyncEntry {
    pub fn new(identifier: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.into(),
            path: path.into(),
        }
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Read the current content. `None` if the file does not exist.
    pub async fn read(&self) -> std::io::Result<Option<Bytes>> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Display for SyncEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.identifier, self.path.display())
    }
}

pub fn content_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

#[derive(Debug, Default, Clone)]
pub struct Manifest {
    entries: BTreeMap<String, SyncEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(files: &[FileConfig]) -> Result<Self> {
        let mut manifest = Self::new();
        for file in files {
            manifest.insert(SyncEntry::new(&file.id, &file.path))?;
        }
        Ok(manifest)
    }

    pub fn insert(&mut self, entry: SyncEntry) -> Result<()> {
        validate_identifier(&entry.identifier)?;
        if self.entries.contains_key(&entry.identifier) {
            return Err(SyncError::Config(format!(
                "File '{}' is already in the manifest",
                entry.identifier
            )));
        }
        self.entries.insert(entry.identifier.clone(), entry);
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<&SyncEntry> {
        self.entries.get(identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Describe every entry whose file currently exists, with its size and
    /// content hash. Unreadable files are left out.
    pub async fn offered(&self) -> Vec<OfferedFile> {
        let mut offered = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            match entry.read().await {
                Ok(Some(data)) => offered.push(OfferedFile {
                    identifier: entry.identifier.clone(),
                    size: data.len() as u64,
                    hash: content_hash(&data),
                }),
                Ok(None) => tracing::debug!("Not offering {}: file missing", entry),
                Err(e) => tracing::warn!("Not offering {}: {}", entry, e),
            }
        }
        offered
    }
}
