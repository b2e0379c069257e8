//! Apply stage: write received files and ask for a restart.
//!
//! Writes overwrite in place. A crash mid-write can leave a partial file;
//! a write failure is logged and the remaining files are still written.

use crate::error::{Result, SyncError};
use crate::exchange::registry::validate_identifier;
use bytes::Bytes;
use colored::Colorize;
use serde::Serialize;
use std::io::BufRead;
use std::path::{Component, Path, PathBuf};

/// Map an identifier (`namespace:path`) to its destination under `data_dir`.
///
/// `mymod:config/main.toml` lands at `<data_dir>/mymod/config/main.toml`.
pub fn resolve_destination(data_dir: &Path, identifier: &str) -> Result<PathBuf> {
    validate_identifier(identifier)?;
    let (namespace, path) = identifier
        .split_once(':')
        .ok_or_else(|| SyncError::PathEscapes(identifier.to_string()))?;

    let relative = Path::new(namespace).join(path);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(SyncError::PathEscapes(identifier.to_string())),
        }
    }

    let full = data_dir.join(&relative);
    if !normalize_path(&full).starts_with(normalize_path(data_dir)) {
        return Err(SyncError::PathEscapes(identifier.to_string()));
    }
    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// A file received from the server, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub identifier: String,
    pub destination: PathBuf,
    pub data: Bytes,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ApplyReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<FailedWrite>,
    pub bytes_written: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedWrite {
    pub path: PathBuf,
    pub error: String,
}

impl ApplyReport {
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.failed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Applier;

impl Applier {
    pub fn new() -> Self {
        Self
    }

    pub async fn apply(&self, files: Vec<ReceivedFile>) -> ApplyReport {
        let mut report = ApplyReport::default();
        tracing::info!("Writing {} files:", files.len());

        for file in files {
            tracing::info!(
                "    - Writing {} ({} bytes)",
                file.destination.display(),
                file.data.len()
            );
            match write_file(&file.destination, &file.data).await {
                Ok(()) => {
                    report.bytes_written += file.data.len() as u64;
                    report.written.push(file.destination);
                }
                Err(e) => {
                    tracing::error!(
                        "    --> Writing {} failed: {}",
                        file.destination.display(),
                        e
                    );
                    report.failed.push(FailedWrite {
                        path: file.destination,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }
}

async fn write_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, data).await
}

/// Hook invoked once received files have been written. New files only take
/// effect on the next start, so the only way forward is a restart.
///
/// Runs on the blocking pool, so implementations may wait on the terminal.
pub trait RestartPrompt: Send + 'static {
    fn confirm_restart(&mut self, report: &ApplyReport);
}

/// Terminal prompt. Blocks until the user presses Enter unless `assume_yes`.
#[derive(Debug, Default)]
pub struct ConsolePrompt {
    pub assume_yes: bool,
}

impl ConsolePrompt {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl RestartPrompt for ConsolePrompt {
    fn confirm_restart(&mut self, report: &ApplyReport) {
        eprintln!(
            "{} {} file(s) updated ({} bytes){}",
            "Sync complete:".green().bold(),
            report.written.len(),
            report.bytes_written,
            if report.failed.is_empty() {
                String::new()
            } else {
                format!(", {} failed", report.failed.len())
                    .red()
                    .to_string()
            }
        );
        eprintln!("{}", "A restart is required to load the new files.".yellow());
        if self.assume_yes {
            return;
        }
        eprint!("Press Enter to exit...");
        let mut line = String::new();
        if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
            tracing::debug!("Failed to read confirmation: {}", e);
        }
    }
}
