//! TFTP File Transfer Logic
//!
//! The two stream types handed to request handlers. An [`OutgoingTransfer`]
//! pumps bytes from any `AsyncRead` to the client (a download); an
//! [`IncomingTransfer`] pumps the client's bytes into any `AsyncWrite` (an
//! upload). Both run over a dedicated ephemeral socket, negotiate options
//! lazily on first use, and retransmit on timeout.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::{Instant, timeout_at};

use crate::protocol::{BlockSizeConfig, Packet, TftpError, TftpErrorCode};

const TIMEOUT_SECS: u64 = 5;
const MAX_RETRIES: usize = 8;

/// Per-transfer timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bound on a single send/await round trip.
    pub timeout: Duration,
    /// How many times one packet is sent before the transfer gives up.
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
        }
    }
}

/// The ephemeral socket of one transfer, locked to a single peer.
pub(crate) struct Channel {
    sock: UdpSocket,
    peer: SocketAddr,
    config: TransferConfig,
    buf: Vec<u8>,
    /// Set once the peer has terminated the exchange with an ERROR.
    aborted: bool,
}

impl Channel {
    /// Bind an ephemeral socket appropriate for the client address family.
    pub(crate) async fn open(peer: SocketAddr, local_bind: Option<IpAddr>, config: TransferConfig) -> io::Result<Self> {
        let bind_addr: SocketAddr = match (local_bind, peer) {
            (Some(ip), _) => SocketAddr::new(ip, 0),
            (None, SocketAddr::V4(_)) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
            (None, SocketAddr::V6(_)) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
        };

        let sock = UdpSocket::bind(bind_addr).await?;
        tracing::debug!("Transfer socket for {} bound to {}", peer, sock.local_addr()?);

        Ok(Self {
            sock,
            peer,
            config,
            buf: vec![0u8; BlockSizeConfig::MAX + 4],
            aborted: false,
        })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub(crate) async fn send(&self, packet: &Packet) -> io::Result<()> {
        self.sock.send_to(&packet.encode(), self.peer).await.map(|_| ())
    }

    /// Report a failure to the peer, unless the peer already gave up.
    pub(crate) async fn send_error(&self, err: &TftpError) {
        if self.aborted {
            return;
        }
        if let Err(e) = self.send(&Packet::Error(err.clone())).await {
            tracing::debug!("Failed to send error to {}: {}", self.peer, e);
        }
    }

    /// Receive the next well-formed packet from the peer.
    ///
    /// Datagrams from any other endpoint are answered with "Unknown transfer
    /// ID" and otherwise ignored, as are malformed datagrams.
    async fn recv(&mut self) -> io::Result<Packet> {
        loop {
            let (n, src) = self.sock.recv_from(&mut self.buf).await?;

            if src != self.peer {
                let stray = Packet::Error(TftpError::with_default_message(TftpErrorCode::UnknownTransferId));
                if let Err(e) = self.sock.send_to(&stray.encode(), src).await {
                    tracing::debug!("Failed to reject stray packet from {}: {}", src, e);
                }
                continue;
            }

            match Packet::parse(&self.buf[..n]) {
                Ok(packet) => return Ok(packet),
                Err(e) => tracing::debug!("Ignoring malformed packet from {}: {}", src, e),
            }
        }
    }

    /// Send `packet` and wait for a reply that `accept` maps to a value.
    ///
    /// Replies that `accept` rejects (stale duplicates, unexpected opcodes)
    /// do not restart the timer. An ERROR from the peer aborts immediately.
    async fn round_trip<T>(&mut self, packet: &Packet, mut accept: impl FnMut(Packet) -> Option<T>) -> io::Result<T> {
        let encoded = packet.encode();

        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                tracing::debug!("Retransmitting {} to {} (attempt {})", packet.opcode(), self.peer, attempt + 1);
            }
            self.sock.send_to(&encoded, self.peer).await?;

            let deadline = Instant::now() + self.config.timeout;
            loop {
                let received = timeout_at(deadline, self.recv()).await;
                match received {
                    Ok(Ok(Packet::Error(err))) => {
                        self.aborted = true;
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            format!("client aborted transfer: {}", err),
                        ));
                    }
                    Ok(Ok(reply)) => {
                        if let Some(value) = accept(reply) {
                            return Ok(value);
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_) => break,
                }
            }
        }

        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "no response from {} after {} attempts",
                self.peer, self.config.max_retries
            ),
        ))
    }
}

/// Outcome of option negotiation.
struct Negotiated {
    block_size: usize,
    /// Options to echo in an OACK; empty means no OACK is sent.
    accepted: HashMap<String, String>,
}

fn negotiate(requested: &HashMap<String, String>, tsize: Option<u64>) -> Negotiated {
    let mut accepted = HashMap::new();
    let mut block_size = BlockSizeConfig::DEFAULT;

    if let Some(value) = requested.get("blksize") {
        block_size = BlockSizeConfig::from_option(value).size;
        accepted.insert("blksize".to_string(), block_size.to_string());
    }

    if requested.contains_key("tsize")
        && let Some(size) = tsize
    {
        accepted.insert("tsize".to_string(), size.to_string());
    }

    // Windowed transfers are not supported; a window of 1 is plain lock-step.
    if requested.contains_key("windowsize") {
        accepted.insert("windowsize".to_string(), "1".to_string());
    }

    // TianoCore treats an OACK as malformed unless every option it sent comes
    // back, so the timeout is echoed even though the configured one applies.
    if let Some(value) = requested.get("timeout") {
        accepted.insert("timeout".to_string(), value.clone());
    }

    Negotiated { block_size, accepted }
}

fn already_started() -> io::Error {
    io::Error::other("transfer stream already consumed")
}

/// Read until `buf` is full or the reader is exhausted.
async fn fill_block<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// A download in progress: the server sends, the client acknowledges.
pub struct OutgoingTransfer {
    channel: Channel,
    filename: String,
    options: HashMap<String, String>,
    size: Option<u64>,
    bytes: u64,
    started: bool,
}

impl OutgoingTransfer {
    pub(crate) fn new(channel: Channel, filename: String, options: HashMap<String, String>) -> Self {
        Self {
            channel,
            filename,
            options,
            size: None,
            bytes: 0,
            started: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.peer()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Declare the total size, answering a `tsize` option if the client sent one.
    pub fn set_size(&mut self, size: u64) {
        self.size = Some(size);
    }

    /// Bytes acknowledged by the client so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    /// Stream `reader` to the client until EOF.
    ///
    /// Returns the number of bytes the client acknowledged. May only be
    /// called once per transfer.
    pub async fn read_from<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> io::Result<u64> {
        if self.started {
            return Err(already_started());
        }
        self.started = true;

        let Negotiated { block_size, accepted } = negotiate(&self.options, self.size);
        if !accepted.is_empty() {
            tracing::debug!("Sending OACK to {}: {:?}", self.channel.peer(), accepted);
            self.channel
                .round_trip(&Packet::OptionAck(accepted), |reply| matches!(reply, Packet::Ack(0)).then_some(()))
                .await?;
        }

        let mut block: u16 = 0;
        let mut chunk = vec![0u8; block_size];
        loop {
            let len = fill_block(&mut reader, &mut chunk).await?;
            block = block.wrapping_add(1);

            let packet = Packet::Data {
                block,
                data: chunk[..len].to_vec(),
            };
            self.channel
                .round_trip(&packet, |reply| matches!(reply, Packet::Ack(n) if n == block).then_some(()))
                .await?;
            self.bytes += len as u64;

            // A short block, possibly empty, ends the transfer.
            if len < block_size {
                return Ok(self.bytes);
            }
        }
    }

    pub(crate) async fn conclude(&mut self, result: Result<(), TftpError>) {
        conclude(&self.channel, self.started, result).await;
    }
}

/// An upload in progress: the client sends, the server acknowledges.
pub struct IncomingTransfer {
    channel: Channel,
    filename: String,
    options: HashMap<String, String>,
    bytes: u64,
    started: bool,
}

impl IncomingTransfer {
    pub(crate) fn new(channel: Channel, filename: String, options: HashMap<String, String>) -> Self {
        Self {
            channel,
            filename,
            options,
            bytes: 0,
            started: false,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.channel.peer()
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Size announced by the client through the `tsize` option.
    pub fn size(&self) -> Option<u64> {
        self.options.get("tsize").and_then(|v| v.parse().ok())
    }

    /// Bytes received and written so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    /// Receive the client's file into `writer`.
    ///
    /// The writer is flushed before the final block is acknowledged. Returns
    /// the number of bytes written. May only be called once per transfer.
    pub async fn write_to<W: AsyncWrite + Unpin>(&mut self, mut writer: W) -> io::Result<u64> {
        if self.started {
            return Err(already_started());
        }
        self.started = true;

        let Negotiated { block_size, accepted } = negotiate(&self.options, self.size());
        let mut reply = if accepted.is_empty() {
            Packet::Ack(0)
        } else {
            tracing::debug!("Sending OACK to {}: {:?}", self.channel.peer(), accepted);
            Packet::OptionAck(accepted)
        };

        let mut expected: u16 = 1;
        loop {
            let data = self
                .channel
                .round_trip(&reply, |packet| match packet {
                    Packet::Data { block, data } if block == expected => Some(data),
                    _ => None,
                })
                .await?;

            writer.write_all(&data).await?;
            self.bytes += data.len() as u64;
            reply = Packet::Ack(expected);

            if data.len() < block_size {
                writer.flush().await?;
                self.channel.send(&reply).await?;
                return Ok(self.bytes);
            }
            expected = expected.wrapping_add(1);
        }
    }

    pub(crate) async fn conclude(&mut self, result: Result<(), TftpError>) {
        conclude(&self.channel, self.started, result).await;
    }
}

/// Tell the client how a handler invocation ended.
async fn conclude(channel: &Channel, started: bool, result: Result<(), TftpError>) {
    match result {
        Ok(()) if started => {}
        Ok(()) => {
            let err = TftpError::new(TftpErrorCode::NotDefined, "server did not transfer any data");
            channel.send_error(&err).await;
        }
        Err(err) => {
            if !channel.is_aborted() {
                tracing::debug!("Reporting error to {}: {}", channel.peer(), err);
            }
            channel.send_error(&err).await;
        }
    }
}
