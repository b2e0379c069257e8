//! Decides which offered files a client needs.
//!
//! Compares the server's offered manifest with what is already on disk and
//! yields the identifiers whose local copy is missing or differs.

use crate::exchange::apply::resolve_destination;
use crate::exchange::manifest::content_hash;
use crate::exchange::protocol::OfferedFile;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Generator configuration
pub struct GeneratorConfig {
    /// Client data directory the files are written under
    pub data_dir: PathBuf,
    /// Only consider these identifiers; every offered file when empty
    pub only: BTreeSet<String>,
}

pub struct Generator {
    config: GeneratorConfig,
}

impl Generator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub async fn plan(&self, offered: &[OfferedFile]) -> Vec<String> {
        let mut wanted = Vec::new();

        for file in offered {
            if !self.config.only.is_empty() && !self.config.only.contains(&file.identifier) {
                continue;
            }

            let destination = match resolve_destination(&self.config.data_dir, &file.identifier) {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!("Ignoring offered file {}: {}", file.identifier, e);
                    continue;
                }
            };

            match tokio::fs::read(&destination).await {
                Ok(local)
                    if local.len() as u64 == file.size && content_hash(&local) == file.hash =>
                {
                    tracing::debug!("{} is up to date", file.identifier);
                }
                Ok(_) => {
                    tracing::info!(
                        "{} differs from the server copy ({})",
                        file.identifier,
                        file.hash_hex()
                    );
                    wanted.push(file.identifier.clone());
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    tracing::info!("{} is missing locally", file.identifier);
                    wanted.push(file.identifier.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        "Cannot read local {}: {}; requesting server copy",
                        destination.display(),
                        e
                    );
                    wanted.push(file.identifier.clone());
                }
            }
        }

        wanted
    }
}
