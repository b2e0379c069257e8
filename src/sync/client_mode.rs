//! Client mode sync - pulls files from a `modsync serve` instance.
//!
//! The connection task speaks the protocol; received files are handed to the
//! main loop on the caller's task, which writes them and prompts for restart.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::Config;
use crate::exchange::{
    channel::{main_thread_channel, MainThreadSender, MainThreadTask},
    pipeline::{Connection, SessionHandler},
    protocol::{negotiate_version, HelloClient, HelloServer, Message, RequestFiles, SendFiles},
    token::TokenTracker,
    ApplyReport, DescriptorRegistry, Generator, GeneratorConfig, MainLoop, MainLoopOutcome,
    Receiver, ReceiverConfig, RestartPrompt, Side, SyncStats,
};
use crate::transport::server::ServerConnection;

/// Client end of one connection.
pub struct ClientSession {
    mod_version: String,
    explicit: Vec<String>,
    auto_sync: bool,
    generator: Generator,
    receiver: Receiver,
    tokens: TokenTracker,
    main_tx: MainThreadSender,
    stats: SyncStats,
    finished: bool,
}

impl ClientSession {
    pub fn new(config: &Config, main_tx: MainThreadSender) -> Self {
        let data_dir = config.client.data_dir.clone();
        Self {
            mod_version: config.mod_version.clone(),
            explicit: config.client.files.clone(),
            auto_sync: config.client.auto_sync,
            generator: Generator::new(GeneratorConfig {
                data_dir: data_dir.clone(),
                only: BTreeSet::new(),
            }),
            receiver: Receiver::new(ReceiverConfig { data_dir }),
            tokens: TokenTracker::new(),
            main_tx,
            stats: SyncStats::new(),
            finished: false,
        }
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    async fn on_hello(&mut self, hello: HelloClient) -> Result<Vec<Message>> {
        let negotiated = negotiate_version(hello.protocol_version);
        if !negotiated.is_supported() {
            tracing::warn!(
                "Server protocol is incompatible ({:?}), file sync disabled",
                negotiated
            );
            self.stats.sync_enabled = false;
            self.finished = true;
            return Ok(Vec::new());
        }
        if hello.mod_version != self.mod_version {
            tracing::info!(
                "Server runs mod version {}, client {}",
                hello.mod_version,
                self.mod_version
            );
        }
        self.stats.sync_enabled = true;
        self.receiver.set_offered(&hello.offered);

        let wanted = if !self.explicit.is_empty() {
            self.explicit.clone()
        } else if self.auto_sync {
            self.generator.plan(&hello.offered).await
        } else {
            tracing::info!("Automatic file sync is off");
            Vec::new()
        };

        if wanted.is_empty() {
            tracing::info!("All {} offered files are up to date", hello.offered.len());
            self.finished = true;
            return Ok(Vec::new());
        }

        let token = self.tokens.issue(wanted.iter().cloned());
        self.stats.files_requested = wanted.len() as u64;
        tracing::info!("Requesting {} files from server", wanted.len());
        Ok(vec![Message::RequestFiles(RequestFiles {
            token: token.to_string(),
            identifiers: wanted,
        })])
    }

    async fn on_files(&mut self, response: SendFiles) -> Result<()> {
        let outcome = self.receiver.accept(response, &mut self.tokens);
        if !outcome.accepted {
            self.stats.stale_responses += 1;
            return Ok(());
        }

        self.stats.files_skipped += outcome.skipped as u64;
        self.stats.files_received += outcome.files.len() as u64;
        self.stats.bytes_received += outcome
            .files
            .iter()
            .map(|f| f.data.len() as u64)
            .sum::<u64>();

        if !outcome.files.is_empty() {
            self.main_tx
                .send(MainThreadTask::ApplyFiles(outcome.files))
                .await
                .map_err(|_| anyhow::anyhow!("Main loop is gone"))?;
        }
        if !self.tokens.has_outstanding() {
            self.finished = true;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionHandler for ClientSession {
    fn side(&self) -> Side {
        Side::Client
    }

    async fn on_connect(&mut self) -> Result<Vec<Message>> {
        Ok(vec![Message::HelloServer(HelloServer::new(
            self.mod_version.clone(),
        ))])
    }

    async fn handle(&mut self, message: Message) -> Result<Vec<Message>> {
        match message {
            Message::HelloClient(hello) => self.on_hello(hello).await,
            Message::SendFiles(response) => {
                self.on_files(response).await?;
                Ok(Vec::new())
            }
            other => {
                tracing::debug!("Client ignoring {}", other.identifier());
                Ok(Vec::new())
            }
        }
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Result of a pull
#[derive(Debug, Clone, Serialize)]
pub struct PullReport {
    pub restart_required: bool,
    pub applied: ApplyReport,
    pub stats: SyncStats,
}

/// Pull files from the configured server
pub async fn sync_pull<P: RestartPrompt>(config: &Config, prompt: P) -> Result<PullReport> {
    let connection =
        ServerConnection::connect(&config.client.server, config.client.sync_timeout()).await?;
    let (reader, writer) = connection.split();
    sync_over(reader, writer, config, prompt).await
}

/// Run a pull over an already established stream.
pub async fn sync_over<R, W, P>(
    reader: R,
    writer: W,
    config: &Config,
    prompt: P,
) -> Result<PullReport>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    P: RestartPrompt,
{
    let registry = Arc::new(DescriptorRegistry::with_defaults());
    let (main_tx, main_rx) = main_thread_channel();
    let mut session = ClientSession::new(config, main_tx);
    let mut connection = Connection::new(registry, &config.transfer);
    let timeout = config.client.sync_timeout();

    let connection_task = tokio::spawn(async move {
        let (mut reader, mut writer) = (reader, writer);
        let run = connection.run(&mut reader, &mut writer, &mut session);
        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!("Connection to server failed: {:#}", e),
            Err(_) => tracing::warn!("File sync timed out after {:?}", timeout),
        }
        // Dropping the session closes the main loop channel
        session.stats().clone()
    });

    let outcome = MainLoop::new(main_rx, prompt).run().await;
    let stats = connection_task.await?;

    Ok(match outcome {
        MainLoopOutcome::UpToDate => PullReport {
            restart_required: false,
            applied: ApplyReport::default(),
            stats,
        },
        MainLoopOutcome::RestartRequired(applied) => PullReport {
            restart_required: true,
            applied,
            stats,
        },
    })
}
