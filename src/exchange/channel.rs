//! Hand-off from the connection task to the main loop.
//!
//! The connection task decodes and validates; anything that touches local
//! state (writing files, prompting the user) is queued here and run by the
//! main loop instead.

use crate::exchange::apply::{Applier, ApplyReport, ReceivedFile, RestartPrompt};
use serde::Serialize;
use tokio::sync::mpsc;

/// Channel size for connection task -> main loop
pub const MAIN_THREAD_CHANNEL_SIZE: usize = 16;

/// Work queued for the main loop.
#[derive(Debug)]
pub enum MainThreadTask {
    /// Write files received from the server
    ApplyFiles(Vec<ReceivedFile>),
}

pub type MainThreadSender = mpsc::Sender<MainThreadTask>;

pub type MainThreadReceiver = mpsc::Receiver<MainThreadTask>;

/// Create a bounded channel for connection task -> main loop hand-off
pub fn main_thread_channel() -> (MainThreadSender, MainThreadReceiver) {
    mpsc::channel(MAIN_THREAD_CHANNEL_SIZE)
}

// =============================================================================
// Sync statistics
// =============================================================================

/// Statistics for one client sync session
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncStats {
    /// Handshake succeeded and file sync was allowed
    pub sync_enabled: bool,

    /// Files asked for in the last request
    pub files_requested: u64,

    /// Files accepted from the server and queued for writing
    pub files_received: u64,

    /// Entries dropped while receiving
    pub files_skipped: u64,

    /// Bytes accepted from the server
    pub bytes_received: u64,

    /// Responses rejected for carrying a stale or unknown token
    pub stale_responses: u64,
}

impl SyncStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// =============================================================================
// Main loop
// =============================================================================

#[derive(Debug)]
pub enum MainLoopOutcome {
    /// Nothing was written
    UpToDate,
    /// Files were written (or failed to write); a restart was requested
    RestartRequired(ApplyReport),
}

/// Runs queued tasks until the connection side hangs up.
pub struct MainLoop<P> {
    rx: MainThreadReceiver,
    applier: Applier,
    prompt: P,
}

impl<P: RestartPrompt> MainLoop<P> {
    pub fn new(rx: MainThreadReceiver, prompt: P) -> Self {
        Self {
            rx,
            applier: Applier::new(),
            prompt,
        }
    }

    pub async fn run(mut self) -> MainLoopOutcome {
        let mut report = ApplyReport::default();

        while let Some(task) = self.rx.recv().await {
            match task {
                MainThreadTask::ApplyFiles(files) => {
                    let applied = self.applier.apply(files).await;
                    report.bytes_written += applied.bytes_written;
                    report.written.extend(applied.written);
                    report.failed.extend(applied.failed);
                }
            }
        }

        if report.is_empty() {
            return MainLoopOutcome::UpToDate;
        }

        let mut prompt = self.prompt;
        let shown = report.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || prompt.confirm_restart(&shown)).await {
            tracing::error!("Restart prompt failed: {}", e);
        }
        MainLoopOutcome::RestartRequired(report)
    }
}
