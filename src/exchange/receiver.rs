//! Validates `send_files` responses on the client.
//!
//! A response is only honored if it carries the outstanding request token;
//! otherwise it counts as zero files. Individual bad entries are skipped.

use crate::exchange::apply::{resolve_destination, ReceivedFile};
use crate::exchange::manifest::content_hash;
use crate::exchange::protocol::{OfferedFile, SendFiles, HASH_LEN};
use crate::exchange::token::{TokenCheck, TokenTracker};
use std::collections::HashMap;
use std::path::PathBuf;

/// Receiver configuration
pub struct ReceiverConfig {
    /// Client data directory the files are written under
    pub data_dir: PathBuf,
}

/// Result of validating one response
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// The token matched the outstanding request
    pub accepted: bool,
    pub files: Vec<ReceivedFile>,
    pub skipped: usize,
}

pub struct Receiver {
    config: ReceiverConfig,
    expected_hashes: HashMap<String, [u8; HASH_LEN]>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            expected_hashes: HashMap::new(),
        }
    }

    /// Remember the hashes the server advertised, to check received content.
    pub fn set_offered(&mut self, offered: &[OfferedFile]) {
        self.expected_hashes = offered
            .iter()
            .map(|f| (f.identifier.clone(), f.hash))
            .collect();
    }

    pub fn accept(&self, response: SendFiles, tokens: &mut TokenTracker) -> ReceiveOutcome {
        let request = match tokens.check(&response.token) {
            TokenCheck::Accepted(request) => request,
            TokenCheck::Stale | TokenCheck::NoneOutstanding => {
                tracing::error!(
                    "Unrequested file transfer (token {}), ignoring {} files",
                    response.token,
                    response.files.len()
                );
                return ReceiveOutcome::default();
            }
        };

        let mut outcome = ReceiveOutcome {
            accepted: true,
            ..Default::default()
        };

        tracing::info!("Server sent {} files:", response.files.len());
        for reason in &response.failed {
            tracing::error!("    - Failed to receive file: {}", reason);
            outcome.skipped += 1;
        }

        for file in response.files {
            if !request.identifiers.contains(&file.identifier) {
                tracing::warn!("    - {} was not requested, skipping", file.identifier);
                outcome.skipped += 1;
                continue;
            }
            let destination = match resolve_destination(&self.config.data_dir, &file.identifier) {
                Ok(path) => path,
                Err(e) => {
                    tracing::error!("    - {}: {}", file.identifier, e);
                    outcome.skipped += 1;
                    continue;
                }
            };
            if let Some(expected) = self.expected_hashes.get(&file.identifier) {
                if content_hash(&file.data) != *expected {
                    tracing::error!(
                        "    - {} does not match the advertised hash, skipping",
                        file.identifier
                    );
                    outcome.skipped += 1;
                    continue;
                }
            }

            tracing::info!("    - {} ({} bytes)", file.identifier, file.data.len());
            outcome.files.push(ReceivedFile {
                identifier: file.identifier,
                destination,
                data: file.data,
            });
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::protocol::FilePayload;
    use bytes::Bytes;
    use std::path::Path;

    fn receiver() -> Receiver {
        Receiver::new(ReceiverConfig {
            data_dir: PathBuf::from("/data"),
        })
    }

    fn payload(identifier: &str, data: &'static [u8]) -> FilePayload {
        FilePayload {
            identifier: identifier.to_string(),
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn test_accepts_matching_token() {
        let mut tokens = TokenTracker::new();
        let token = tokens.issue(["mod:a", "mod:b"]);

        let outcome = receiver().accept(
            SendFiles::new(token.as_str(), vec![payload("mod:a", b"0123456789")]),
            &mut tokens,
        );

        assert!(outcome.accepted);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].destination, Path::new("/data/mod/a"));
        assert_eq!(outcome.files[0].data.len(), 10);
        assert!(!tokens.has_outstanding());
    }

    #[test]
    fn test_mismatched_token_yields_zero_files() {
        let mut tokens = TokenTracker::new();
        tokens.issue(["mod:a"]);

        let outcome = receiver().accept(
            SendFiles::new("forged", vec![payload("mod:a", b"evil")]),
            &mut tokens,
        );

        assert!(!outcome.accepted);
        assert!(outcome.files.is_empty());
        // The real response can still arrive
        assert!(tokens.has_outstanding());
    }

    #[test]
    fn test_superseded_token_rejected() {
        let mut tokens = TokenTracker::new();
        let old = tokens.issue(["mod:a"]);
        let _new = tokens.issue(["mod:a"]);

        let outcome = receiver().accept(
            SendFiles::new(old.as_str(), vec![payload("mod:a", b"old")]),
            &mut tokens,
        );
        assert!(!outcome.accepted);
        assert!(outcome.files.is_empty());
    }

    #[test]
    fn test_bad_entries_skipped() {
        let mut tokens = TokenTracker::new();
        let token = tokens.issue(["mod:a", "mod:hashed"]);
        let mut receiver = receiver();
        receiver.set_offered(&[OfferedFile {
            identifier: "mod:hashed".to_string(),
            size: 4,
            hash: content_hash(b"good"),
        }]);

        let mut response = SendFiles::new(
            token.as_str(),
            vec![
                payload("mod:a", b"fine"),
                payload("mod:unrequested", b"x"),
                payload("mod:hashed", b"bad!"),
            ],
        );
        response.failed.push("entry 3: invalid UTF-8 in identifier".to_string());

        let outcome = receiver.accept(response, &mut tokens);
        assert!(outcome.accepted);
        assert_eq!(outcome.files.len(), 1);
        assert_eq!(outcome.files[0].identifier, "mod:a");
        assert_eq!(outcome.skipped, 3);
    }
}
