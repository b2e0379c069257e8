#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use modsync::config::{Config, FileConfig, TransferConfig};
    use modsync::exchange::apply::{ApplyReport, RestartPrompt};
    use modsync::exchange::manifest::content_hash;
    use modsync::exchange::protocol::{
        encode_inner, frame, read_frame, write_frame, FilePayload, HelloClient, Message,
        OfferedFile, RequestFiles, SendFiles, PROTOCOL_VERSION,
    };
    use modsync::server::{self, ServerContext};
    use modsync::sync::{sync_over, sync_pull};
    use tempfile::TempDir;
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};

    #[derive(Clone, Default)]
    struct RecordingPrompt {
        shown: Arc<Mutex<Vec<usize>>>,
    }

    impl RestartPrompt for RecordingPrompt {
        fn confirm_restart(&mut self, report: &ApplyReport) {
            self.shown.lock().unwrap().push(report.written.len());
        }
    }

    fn config(server_root: &Path, data_dir: &Path, files: &[(&str, &str)]) -> Config {
        let mut config = Config::default();
        config.server.files = files
            .iter()
            .map(|(id, path)| FileConfig {
                id: id.to_string(),
                path: server_root.join(path),
            })
            .collect();
        config.client.data_dir = data_dir.to_path_buf();
        config.client.sync_timeout_secs = 10;
        config
    }

    /// Serve one in-memory connection with the real server session.
    fn spawn_server(config: &Config, io: DuplexStream) -> tokio::task::JoinHandle<()> {
        let ctx = ServerContext::from_config(config).unwrap();
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(io);
            server::serve_connection(&mut reader, &mut writer, &ctx)
                .await
                .unwrap();
        })
    }

    async fn send<W: AsyncWrite + Unpin>(w: &mut W, message: Message) {
        let inner = message.encode_inner().unwrap();
        write_frame(w, &frame(&inner).unwrap()).await.unwrap();
    }

    async fn expect<R: AsyncRead + Unpin>(r: &mut R, identifier: &str) -> Bytes {
        let (got, body) = read_frame(r).await.unwrap().unwrap();
        assert_eq!(got, identifier);
        body
    }

    #[tokio::test]
    async fn test_pull_writes_only_existing_files() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let server_root = temp.path().join("server");
        let data_dir = temp.path().join("client");
        fs::create_dir_all(&server_root)?;
        fs::write(server_root.join("a.cfg"), "0123456789")?;
        // b.cfg is configured but does not exist

        let config = config(
            &server_root,
            &data_dir,
            &[("mymod:a.cfg", "a.cfg"), ("mymod:b.cfg", "b.cfg")],
        );
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = spawn_server(&config, server_io);

        let prompt = RecordingPrompt::default();
        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, prompt.clone()).await?;
        server.await?;

        assert!(report.restart_required);
        assert!(report.stats.sync_enabled);
        assert_eq!(report.stats.files_requested, 1);
        assert_eq!(report.stats.files_received, 1);
        assert_eq!(report.applied.bytes_written, 10);
        assert_eq!(
            fs::read_to_string(data_dir.join("mymod/a.cfg"))?,
            "0123456789"
        );
        assert!(!data_dir.join("mymod/b.cfg").exists());
        assert_eq!(*prompt.shown.lock().unwrap(), vec![1]);

        Ok(())
    }

    async fn forward<R, W>(from: &mut R, to: &mut W, identifier: &str) -> Bytes
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let body = expect(from, identifier).await;
        let inner = encode_inner(identifier, &body).unwrap();
        write_frame(to, &frame(&inner).unwrap()).await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_file_deleted_after_handshake_is_left_out() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let server_root = temp.path().join("server");
        let data_dir = temp.path().join("client");
        fs::create_dir_all(&server_root)?;
        fs::write(server_root.join("a.cfg"), "0123456789")?;
        fs::write(server_root.join("b.cfg"), "soon gone")?;

        let mut config = config(
            &server_root,
            &data_dir,
            &[("mymod:a.cfg", "a.cfg"), ("mymod:b.cfg", "b.cfg")],
        );
        config.client.files = vec!["mymod:a.cfg".to_string(), "mymod:b.cfg".to_string()];

        let (server_io, relay_server_io) = tokio::io::duplex(64 * 1024);
        let (relay_client_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = spawn_server(&config, server_io);

        // Pass frames through in protocol order, removing b.cfg on the server
        // once the client has asked for it
        let b_path = server_root.join("b.cfg");
        let relay = tokio::spawn(async move {
            let (mut from_client, mut to_client) = tokio::io::split(relay_client_io);
            let (mut from_server, mut to_server) = tokio::io::split(relay_server_io);

            forward(&mut from_client, &mut to_server, "modsync:hello_server").await;
            let body = forward(&mut from_server, &mut to_client, "modsync:hello_client").await;
            assert_eq!(HelloClient::decode(body).unwrap().offered.len(), 2);

            let body = expect(&mut from_client, RequestFiles::IDENTIFIER).await;
            let request = RequestFiles::decode(body).unwrap();
            assert_eq!(request.identifiers, vec!["mymod:a.cfg", "mymod:b.cfg"]);
            fs::remove_file(&b_path).unwrap();
            send(&mut to_server, Message::RequestFiles(request)).await;

            let body = forward(&mut from_server, &mut to_client, SendFiles::IDENTIFIER).await;
            assert_eq!(SendFiles::decode(body).unwrap().files.len(), 1);
            assert!(read_frame(&mut from_client).await.unwrap().is_none());
        });

        let prompt = RecordingPrompt::default();
        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, prompt.clone()).await?;
        relay.await?;
        server.await?;

        assert!(report.restart_required);
        assert_eq!(report.stats.files_requested, 2);
        assert_eq!(report.stats.files_received, 1);
        assert_eq!(report.stats.files_skipped, 0);
        assert_eq!(
            fs::read_to_string(data_dir.join("mymod/a.cfg"))?,
            "0123456789"
        );
        assert!(!data_dir.join("mymod/b.cfg").exists());
        assert_eq!(*prompt.shown.lock().unwrap(), vec![1]);

        Ok(())
    }

    #[tokio::test]
    async fn test_up_to_date_client_requests_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let server_root = temp.path().join("server");
        let data_dir = temp.path().join("client");
        fs::create_dir_all(&server_root)?;
        fs::create_dir_all(data_dir.join("mymod"))?;
        fs::write(server_root.join("a.cfg"), "same")?;
        fs::write(data_dir.join("mymod/a.cfg"), "same")?;

        let config = config(&server_root, &data_dir, &[("mymod:a.cfg", "a.cfg")]);
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = spawn_server(&config, server_io);

        let prompt = RecordingPrompt::default();
        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, prompt.clone()).await?;
        server.await?;

        assert!(!report.restart_required);
        assert_eq!(report.stats.files_requested, 0);
        assert!(prompt.shown.lock().unwrap().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_large_file_is_chunked() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let server_root = temp.path().join("server");
        let data_dir = temp.path().join("client");
        fs::create_dir_all(&server_root)?;
        let content: Vec<u8> = (0..100_000u32).map(|i| (i * 31 % 251) as u8).collect();
        fs::write(server_root.join("big.dat"), &content)?;

        let mut config = config(&server_root, &data_dir, &[("mymod:data/big.dat", "big.dat")]);
        config.transfer = TransferConfig {
            max_message_size: 8192,
            fragment_size: 4096,
            ..Default::default()
        };
        config.transfer.validate()?;

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let server = spawn_server(&config, server_io);

        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, RecordingPrompt::default()).await?;
        server.await?;

        assert_eq!(report.stats.files_received, 1);
        assert_eq!(fs::read(data_dir.join("mymod/data/big.dat"))?, content);

        Ok(())
    }

    #[tokio::test]
    async fn test_incompatible_server_disables_sync() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let data_dir = temp.path().join("client");
        let config = config(temp.path(), &data_dir, &[]);

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let fake_server = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server_io);
            expect(&mut reader, "modsync:hello_server").await;
            let mut hello = HelloClient::new(
                "9.9.9",
                vec![OfferedFile {
                    identifier: "mymod:a.cfg".to_string(),
                    size: 1,
                    hash: content_hash(b"a"),
                }],
            );
            hello.protocol_version = PROTOCOL_VERSION + 1;
            send(&mut writer, Message::HelloClient(hello)).await;
            // The client never asks for files
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });

        let prompt = RecordingPrompt::default();
        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, prompt.clone()).await?;
        fake_server.await?;

        assert!(!report.stats.sync_enabled);
        assert!(!report.restart_required);
        assert!(!data_dir.exists());
        assert!(prompt.shown.lock().unwrap().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_response_with_wrong_token_writes_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let data_dir = temp.path().join("client");
        let config = config(temp.path(), &data_dir, &[]);

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let fake_server = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server_io);
            expect(&mut reader, "modsync:hello_server").await;
            send(
                &mut writer,
                Message::HelloClient(HelloClient::new(
                    "1.0",
                    vec![OfferedFile {
                        identifier: "mymod:a.cfg".to_string(),
                        size: 4,
                        hash: content_hash(b"evil"),
                    }],
                )),
            )
            .await;
            let body = expect(&mut reader, RequestFiles::IDENTIFIER).await;
            let request = RequestFiles::decode(body).unwrap();
            assert_eq!(request.identifiers, vec!["mymod:a.cfg"]);

            send(
                &mut writer,
                Message::SendFiles(SendFiles::new(
                    format!("not-{}", request.token),
                    vec![FilePayload {
                        identifier: "mymod:a.cfg".to_string(),
                        data: Bytes::from_static(b"evil"),
                    }],
                )),
            )
            .await;
        });

        let prompt = RecordingPrompt::default();
        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, prompt.clone()).await?;
        fake_server.await?;

        assert_eq!(report.stats.stale_responses, 1);
        assert_eq!(report.stats.files_received, 0);
        assert!(!data_dir.join("mymod/a.cfg").exists());
        assert!(prompt.shown.lock().unwrap().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_message_does_not_end_session() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let data_dir = temp.path().join("client");
        let config = config(temp.path(), &data_dir, &[]);

        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let fake_server = tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(server_io);
            expect(&mut reader, "modsync:hello_server").await;

            let unknown = encode_inner("othermod:telemetry", b"\x01\x02").unwrap();
            write_frame(&mut writer, &frame(&unknown).unwrap())
                .await
                .unwrap();
            send(
                &mut writer,
                Message::HelloClient(HelloClient::new(
                    "1.0",
                    vec![OfferedFile {
                        identifier: "mymod:a.cfg".to_string(),
                        size: 2,
                        hash: content_hash(b"ok"),
                    }],
                )),
            )
            .await;

            let body = expect(&mut reader, RequestFiles::IDENTIFIER).await;
            let request = RequestFiles::decode(body).unwrap();
            send(
                &mut writer,
                Message::SendFiles(SendFiles::new(
                    request.token,
                    vec![FilePayload {
                        identifier: "mymod:a.cfg".to_string(),
                        data: Bytes::from_static(b"ok"),
                    }],
                )),
            )
            .await;
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });

        let (reader, writer) = tokio::io::split(client_io);
        let report = sync_over(reader, writer, &config, RecordingPrompt::default()).await?;
        fake_server.await?;

        assert!(report.restart_required);
        assert_eq!(fs::read_to_string(data_dir.join("mymod/a.cfg"))?, "ok");

        Ok(())
    }

    #[tokio::test]
    async fn test_pull_over_tcp() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let server_root = temp.path().join("server");
        let data_dir = temp.path().join("client");
        fs::create_dir_all(&server_root)?;
        fs::write(server_root.join("main.toml"), "enabled = true\n")?;

        let mut config = config(
            &server_root,
            &data_dir,
            &[("mymod:config/main.toml", "main.toml")],
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        config.client.server = listener.local_addr()?.to_string();

        let ctx = ServerContext::from_config(&config)?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let server = tokio::spawn(server::serve(listener, ctx, async move {
            let _ = stop_rx.await;
        }));

        let report = sync_pull(&config, RecordingPrompt::default()).await?;
        assert!(report.restart_required);
        assert_eq!(
            fs::read_to_string(data_dir.join("mymod/config/main.toml"))?,
            "enabled = true\n"
        );

        stop_tx.send(()).ok();
        server.await??;

        Ok(())
    }
}
