//! Builds `send_files` responses on the server.
//!
//! Only requested files that are in the manifest and exist right now are
//! included. Anything else is left out without an error: the client reads
//! an absent entry as "the server does not have it". Files that would push
//! the response past the transfer limit are left out the same way, so the
//! response itself always goes out.

use crate::exchange::chunker::MAX_TRANSFER_SIZE;
use crate::exchange::manifest::Manifest;
use crate::exchange::protocol::{FilePayload, RequestFiles, SendFiles, MAX_IDENTIFIER_LEN};
use std::collections::HashSet;
use std::sync::Arc;

/// Largest `send_files` body that still fits in one chunked transfer
pub const MAX_RESPONSE_BODY: usize = MAX_TRANSFER_SIZE as usize - 2 - MAX_IDENTIFIER_LEN;

pub struct Sender {
    manifest: Arc<Manifest>,
    max_response_size: usize,
}

impl Sender {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self {
            manifest,
            max_response_size: MAX_RESPONSE_BODY,
        }
    }

    /// Cap the encoded response body at `limit` bytes.
    pub fn with_max_response_size(mut self, limit: usize) -> Self {
        self.max_response_size = limit.min(MAX_RESPONSE_BODY);
        self
    }

    pub async fn respond(&self, request: &RequestFiles) -> SendFiles {
        let mut seen = HashSet::new();
        let mut files = Vec::new();
        // token (u16 len + bytes) and the i32 file count
        let mut body_len = 6 + request.token.len();

        for identifier in &request.identifiers {
            if !seen.insert(identifier.as_str()) {
                continue;
            }
            let Some(entry) = self.manifest.get(identifier) else {
                tracing::debug!("Requested file {} is not offered", identifier);
                continue;
            };
            match entry.read().await {
                Ok(Some(data)) => {
                    let entry_len = 6 + entry.identifier.len() + data.len();
                    if body_len + entry_len > self.max_response_size {
                        tracing::warn!(
                            "Not sending {}: {} bytes does not fit the {} byte response limit",
                            entry,
                            data.len(),
                            self.max_response_size
                        );
                        continue;
                    }
                    body_len += entry_len;
                    files.push(FilePayload {
                        identifier: entry.identifier.clone(),
                        data,
                    });
                }
                Ok(None) => tracing::debug!("Requested file {} no longer exists", entry),
                Err(e) => tracing::warn!("Cannot read {}: {}", entry, e),
            }
        }

        let response = SendFiles::new(request.token.clone(), files);
        tracing::info!("Sending {} files to client:", response.files.len());
        for file in &response.files {
            tracing::info!("    - {} ({} bytes)", file.identifier, file.data.len());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::manifest::SyncEntry;
    use std::fs;
    use tempfile::TempDir;

    fn manifest(root: &std::path::Path) -> Arc<Manifest> {
        let mut manifest = Manifest::new();
        manifest
            .insert(SyncEntry::new("test:a", root.join("a.bin")))
            .unwrap();
        manifest
            .insert(SyncEntry::new("test:b", root.join("b.bin")))
            .unwrap();
        Arc::new(manifest)
    }

    #[tokio::test]
    async fn test_respond_with_existing_subset() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), b"0123456789").unwrap();
        fs::write(tmp.path().join("b.bin"), b"").unwrap();
        let sender = Sender::new(manifest(tmp.path()));

        // b is deleted between enumeration and serialization
        fs::remove_file(tmp.path().join("b.bin")).unwrap();

        let response = sender
            .respond(&RequestFiles {
                token: "tok".to_string(),
                identifiers: vec![
                    "test:a".to_string(),
                    "test:b".to_string(),
                    "test:unknown".to_string(),
                ],
            })
            .await;

        assert_eq!(response.token, "tok");
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.files[0].identifier, "test:a");
        assert_eq!(response.files[0].data.as_ref(), b"0123456789");
        assert_eq!(response.total_bytes(), 10);
    }

    #[tokio::test]
    async fn test_duplicate_requests_sent_once() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), b"x").unwrap();
        let sender = Sender::new(manifest(tmp.path()));

        let response = sender
            .respond(&RequestFiles {
                token: "tok".to_string(),
                identifiers: vec!["test:a".to_string(), "test:a".to_string()],
            })
            .await;
        assert_eq!(response.files.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_is_sent() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.bin"), b"").unwrap();
        let sender = Sender::new(manifest(tmp.path()));

        let response = sender
            .respond(&RequestFiles {
                token: "tok".to_string(),
                identifiers: vec!["test:b".to_string()],
            })
            .await;
        assert_eq!(response.files.len(), 1);
        assert!(response.files[0].data.is_empty());
    }

    #[tokio::test]
    async fn test_files_over_the_limit_are_left_out() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![7u8; 200]).unwrap();
        fs::write(tmp.path().join("b.bin"), b"small").unwrap();
        let sender = Sender::new(manifest(tmp.path())).with_max_response_size(64);

        let request = RequestFiles {
            token: "tok".to_string(),
            identifiers: vec!["test:a".to_string(), "test:b".to_string()],
        };
        let response = sender.respond(&request).await;

        assert_eq!(response.token, "tok");
        assert_eq!(response.files.len(), 1);
        assert_eq!(response.files[0].identifier, "test:b");
        assert!(response.encode_body().unwrap().len() <= 64);
    }

    #[tokio::test]
    async fn test_response_goes_out_when_nothing_fits() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.bin"), vec![7u8; 200]).unwrap();
        let sender = Sender::new(manifest(tmp.path())).with_max_response_size(32);

        let response = sender
            .respond(&RequestFiles {
                token: "tok".to_string(),
                identifiers: vec!["test:a".to_string()],
            })
            .await;
        assert_eq!(response.token, "tok");
        assert!(response.files.is_empty());
    }
}
