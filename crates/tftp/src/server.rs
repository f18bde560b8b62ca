//! TFTP Server Implementation
//!
//! The accept loop: requests arriving on the listening socket are handed to
//! a [`Handler`] on their own task, each with a fresh transfer socket. The
//! loop runs until [`Server::shutdown`] is called, then waits for in-flight
//! transfers before returning.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::protocol::{Packet, TftpError, TftpErrorCode, TftpOpcode, TftpRequest, TransferMode};
use crate::transfer::{Channel, IncomingTransfer, OutgoingTransfer, TransferConfig};

/// Request callbacks invoked once per transfer.
///
/// Invocations for different transfers may run concurrently. The returned
/// error decides the ERROR packet the client receives.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Called when a client starts a download.
    async fn read(&self, filename: &str, transfer: &mut OutgoingTransfer) -> Result<(), TftpError>;

    /// Called when a client starts an upload.
    async fn write(&self, filename: &str, transfer: &mut IncomingTransfer) -> Result<(), TftpError>;
}

/// A TFTP server driving a [`Handler`].
pub struct Server<H> {
    handler: Arc<H>,
    config: TransferConfig,
    shutdown: watch::Sender<bool>,
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler: Arc::new(handler),
            config: TransferConfig::default(),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Set the bound on one network round trip. Zero keeps the current value.
    pub fn set_timeout(&mut self, timeout: Duration) {
        if !timeout.is_zero() {
            self.config.timeout = timeout;
        }
    }

    pub fn set_retries(&mut self, retries: usize) {
        self.config.max_retries = retries.max(1);
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Ask [`Server::serve`] to stop accepting requests.
    ///
    /// Idempotent, and effective even if called before `serve`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Serve requests from `socket` until shutdown.
    ///
    /// Returns once the loop has stopped and every in-flight transfer has
    /// finished. Fails only if the listening socket itself fails.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let local_addr = socket.local_addr().context("Failed to get local address")?;
        // Replies leave from the interface the request arrived on.
        let local_bind = Some(local_addr.ip()).filter(|ip| !ip.is_unspecified());

        let mut shutdown = self.shutdown.subscribe();
        let mut transfers = JoinSet::new();
        let mut buffer = [0u8; 2048];

        tracing::debug!("TFTP server accepting requests on {}", local_addr);

        let outcome = loop {
            if *shutdown.borrow_and_update() {
                break Ok(());
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                Some(joined) = transfers.join_next(), if !transfers.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Transfer task failed: {}", e);
                    }
                }
                received = socket.recv_from(&mut buffer) => {
                    match received {
                        Ok((len, client)) => self.dispatch(&buffer[..len], client, local_bind, &mut transfers),
                        // ICMP port-unreachable from an earlier reply surfaces here on some platforms.
                        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                            tracing::debug!("Ignoring connection reset on {}", local_addr);
                        }
                        Err(e) => {
                            break Err(anyhow::Error::new(e).context(format!("Failed to receive on {}", local_addr)));
                        }
                    }
                }
            }
        };

        if !transfers.is_empty() {
            tracing::debug!("Waiting for {} in-flight transfers on {}", transfers.len(), local_addr);
        }
        while let Some(joined) = transfers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Transfer task failed: {}", e);
            }
        }

        outcome
    }

    fn dispatch(&self, packet: &[u8], client: SocketAddr, local_bind: Option<IpAddr>, transfers: &mut JoinSet<()>) {
        match Packet::parse(packet) {
            Ok(Packet::Request(request)) => {
                tracing::debug!(
                    "{} for '{}' in {} mode from {} (options: {:?})",
                    request.opcode,
                    request.filename,
                    request.mode,
                    client,
                    request.options
                );

                let handler = Arc::clone(&self.handler);
                let config = self.config;
                transfers.spawn(async move {
                    handle_request(handler.as_ref(), request, client, local_bind, config).await;
                });
            }
            Ok(other) => {
                tracing::debug!("Ignoring unexpected {} from {}", other.opcode(), client);
            }
            Err(e) => {
                tracing::debug!("Received malformed packet from {}: {}", client, e);
            }
        }
    }
}

async fn handle_request<H: Handler>(
    handler: &H,
    request: TftpRequest,
    client: SocketAddr,
    local_bind: Option<IpAddr>,
    config: TransferConfig,
) {
    let channel = match Channel::open(client, local_bind, config).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!("Failed to open transfer socket for {}: {}", client, e);
            return;
        }
    };

    match request.mode.parse::<TransferMode>() {
        Ok(mode) if mode.is_supported() => {}
        _ => {
            let err = TftpError::new(
                TftpErrorCode::IllegalOperation,
                format!("Transfer mode '{}' not supported", request.mode),
            );
            channel.send_error(&err).await;
            return;
        }
    }

    let TftpRequest {
        opcode,
        filename,
        options,
        ..
    } = request;

    match opcode {
        TftpOpcode::ReadRequest => {
            let mut transfer = OutgoingTransfer::new(channel, filename.clone(), options);
            let result = handler.read(&filename, &mut transfer).await;
            transfer.conclude(result).await;
        }
        TftpOpcode::WriteRequest => {
            let mut transfer = IncomingTransfer::new(channel, filename.clone(), options);
            let result = handler.write(&filename, &mut transfer).await;
            transfer.conclude(result).await;
        }
        _ => {
            channel
                .send_error(&TftpError::with_default_message(TftpErrorCode::IllegalOperation))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::timeout;

    use super::*;

    /// Serves a fixed payload and collects uploads in memory.
    struct MemoryHandler {
        payload: Vec<u8>,
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl Handler for MemoryHandler {
        async fn read(&self, filename: &str, transfer: &mut OutgoingTransfer) -> Result<(), TftpError> {
            if filename != "payload.bin" {
                return Err(TftpError::with_default_message(TftpErrorCode::FileNotFound));
            }
            transfer.set_size(self.payload.len() as u64);
            transfer.read_from(self.payload.as_slice()).await?;
            Ok(())
        }

        async fn write(&self, filename: &str, transfer: &mut IncomingTransfer) -> Result<(), TftpError> {
            let mut data = Vec::new();
            transfer.write_to(&mut data).await?;
            self.uploads.lock().unwrap().push((filename.to_string(), data));
            Ok(())
        }
    }

    async fn start(payload: &[u8]) -> (Arc<Server<MemoryHandler>>, SocketAddr, tokio::task::JoinHandle<Result<()>>) {
        let mut server = Server::new(MemoryHandler {
            payload: payload.to_vec(),
            uploads: Mutex::new(Vec::new()),
        });
        server.set_timeout(Duration::from_millis(200));
        server.set_retries(3);
        let server = Arc::new(server);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let serving = Arc::clone(&server);
        let task = tokio::spawn(async move { serving.serve(socket).await });
        (server, addr, task)
    }

    async fn recv(client: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; 2048];
        let (n, src) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("server did not answer")
            .unwrap();
        (Packet::parse(&buf[..n]).unwrap(), src)
    }

    #[test]
    fn test_zero_timeout_is_ignored() {
        let mut server = Server::new(MemoryHandler {
            payload: Vec::new(),
            uploads: Mutex::new(Vec::new()),
        });
        server.set_timeout(Duration::ZERO);
        assert_eq!(server.timeout(), TransferConfig::default().timeout);
        server.set_timeout(Duration::from_secs(2));
        assert_eq!(server.timeout(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_download_with_options() {
        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let (server, addr, task) = start(&payload).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = TftpRequest::read("payload.bin")
            .with_option("blksize", "1024")
            .with_option("tsize", "0");
        client.send_to(&Packet::Request(request).encode(), addr).await.unwrap();

        let (oack, tid) = recv(&client).await;
        let Packet::OptionAck(options) = oack else {
            panic!("expected OACK, got {:?}", oack);
        };
        assert_eq!(options.get("blksize").map(String::as_str), Some("1024"));
        assert_eq!(options.get("tsize").map(String::as_str), Some("1500"));
        assert_ne!(tid, addr, "transfer must run on its own port");

        client.send_to(&Packet::Ack(0).encode(), tid).await.unwrap();
        let mut received = Vec::new();
        for expected in 1..=2u16 {
            let (packet, _) = recv(&client).await;
            let Packet::Data { block, data } = packet else {
                panic!("expected DATA, got {:?}", packet);
            };
            assert_eq!(block, expected);
            received.extend_from_slice(&data);
            client.send_to(&Packet::Ack(block).encode(), tid).await.unwrap();
        }
        assert_eq!(received, payload);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_handler_error_reaches_client() {
        let (server, addr, task) = start(b"").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Packet::Request(TftpRequest::read("missing.bin")).encode(), addr)
            .await
            .unwrap();

        let (packet, _) = recv(&client).await;
        let Packet::Error(err) = packet else {
            panic!("expected ERROR, got {:?}", packet);
        };
        assert_eq!(err.code, TftpErrorCode::FileNotFound);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_upload_collects_blocks() {
        let (server, addr, task) = start(b"").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Packet::Request(TftpRequest::write("up.bin")).encode(), addr)
            .await
            .unwrap();

        let (ack, tid) = recv(&client).await;
        assert_eq!(ack, Packet::Ack(0));

        let body = vec![7u8; 600];
        for (i, chunk) in body.chunks(512).enumerate() {
            let block = i as u16 + 1;
            let data = Packet::Data {
                block,
                data: chunk.to_vec(),
            };
            client.send_to(&data.encode(), tid).await.unwrap();
            let (ack, _) = recv(&client).await;
            assert_eq!(ack, Packet::Ack(block));
        }

        server.shutdown();
        task.await.unwrap().unwrap();

        let uploads = server.handler().uploads.lock().unwrap();
        assert_eq!(uploads.as_slice(), &[("up.bin".to_string(), body)]);
    }

    #[tokio::test]
    async fn test_stray_packets_are_rejected_without_disturbing_transfer() {
        let (server, addr, task) = start(b"short payload").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&Packet::Request(TftpRequest::read("payload.bin")).encode(), addr)
            .await
            .unwrap();
        let (data, tid) = recv(&client).await;
        assert!(matches!(data, Packet::Data { block: 1, .. }));

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        intruder.send_to(&Packet::Ack(1).encode(), tid).await.unwrap();
        let (packet, _) = recv(&intruder).await;
        let Packet::Error(err) = packet else {
            panic!("expected ERROR, got {:?}", packet);
        };
        assert_eq!(err.code, TftpErrorCode::UnknownTransferId);

        client.send_to(&Packet::Ack(1).encode(), tid).await.unwrap();

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_mode_is_refused() {
        let (server, addr, task) = start(b"data").await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut request = TftpRequest::read("payload.bin");
        request.mode = "netascii".to_string();
        client.send_to(&Packet::Request(request).encode(), addr).await.unwrap();

        let (packet, _) = recv(&client).await;
        let Packet::Error(err) = packet else {
            panic!("expected ERROR, got {:?}", packet);
        };
        assert_eq!(err.code, TftpErrorCode::IllegalOperation);

        server.shutdown();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_serve_returns_immediately() {
        let server = Server::new(MemoryHandler {
            payload: Vec::new(),
            uploads: Mutex::new(Vec::new()),
        });
        server.shutdown();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        timeout(Duration::from_secs(1), server.serve(socket))
            .await
            .expect("serve should observe the earlier shutdown")
            .unwrap();
    }
}
