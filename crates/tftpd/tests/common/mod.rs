//! Shared helpers: a minimal TFTP client and an access-log recorder.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tftp::{Packet, TftpError, TftpRequest};
use tftpd::{ACCESS_LOG_TARGET, App, AppConfig};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

const BLOCK_SIZE: usize = 512;
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

async fn recv(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 2048];
    let (n, peer) = timeout(REPLY_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("server did not answer")
        .unwrap();
    (Packet::parse(&buf[..n]).unwrap(), peer)
}

/// Download `filename` in octet mode without options.
pub async fn get(server: SocketAddr, filename: &str) -> Result<Vec<u8>, TftpError> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&Packet::Request(TftpRequest::read(filename)).encode(), server)
        .await
        .unwrap();

    let mut content = Vec::new();
    let mut expected: u16 = 1;
    loop {
        match recv(&socket).await {
            (Packet::Data { block, data }, peer) => {
                socket.send_to(&Packet::Ack(block).encode(), peer).await.unwrap();
                if block != expected {
                    continue;
                }
                let last = data.len() < BLOCK_SIZE;
                content.extend_from_slice(&data);
                if last {
                    return Ok(content);
                }
                expected = expected.wrapping_add(1);
            }
            (Packet::Error(err), _) => return Err(err),
            (other, _) => panic!("unexpected packet during download: {other:?}"),
        }
    }
}

/// Upload `data` as `filename` in octet mode without options.
pub async fn put(server: SocketAddr, filename: &str, data: &[u8]) -> Result<(), TftpError> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .send_to(&Packet::Request(TftpRequest::write(filename)).encode(), server)
        .await
        .unwrap();

    let peer = match recv(&socket).await {
        (Packet::Ack(0), peer) => peer,
        (Packet::Error(err), _) => return Err(err),
        (other, _) => panic!("unexpected reply to write request: {other:?}"),
    };

    let mut blocks: Vec<&[u8]> = data.chunks(BLOCK_SIZE).collect();
    if data.len() % BLOCK_SIZE == 0 {
        blocks.push(&[]);
    }

    for (i, chunk) in blocks.into_iter().enumerate() {
        let block = (i + 1) as u16;
        let packet = Packet::Data {
            block,
            data: chunk.to_vec(),
        };
        socket.send_to(&packet.encode(), peer).await.unwrap();

        match recv(&socket).await {
            (Packet::Ack(n), _) if n == block => {}
            (Packet::Error(err), _) => return Err(err),
            (other, _) => panic!("unexpected reply to block {block}: {other:?}"),
        }
    }
    Ok(())
}

/// Provision and start an app for `json`, with empty roots set to `root`.
pub async fn start_app(json: &str, root: &Path) -> App {
    let config = AppConfig::from_json(json).unwrap().with_default_root(root);
    let mut app = App::provision(&config).unwrap();
    app.start().await.unwrap();
    app
}

/// The bound address of the instance named `name`.
pub fn addr_of(app: &App, name: &str) -> SocketAddr {
    app.instances()
        .iter()
        .find(|i| i.name() == name)
        .and_then(|i| i.local_addr())
        .expect("instance is not listening")
}

/// Collects the fields of every access-log record and every error event.
#[derive(Clone, Default)]
pub struct AccessLog {
    records: Arc<Mutex<Vec<HashMap<String, String>>>>,
    errors: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl AccessLog {
    /// Install as the default subscriber for the current thread.
    pub fn install() -> (Self, DefaultGuard) {
        let log = Self::default();
        let subscriber = tracing_subscriber::registry().with(log.clone());
        (log, tracing::subscriber::set_default(subscriber))
    }

    pub fn records(&self) -> Vec<HashMap<String, String>> {
        self.records.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<HashMap<String, String>> {
        self.errors.lock().unwrap().clone()
    }
}

impl<S: Subscriber> Layer<S> for AccessLog {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let sink = if metadata.target() == ACCESS_LOG_TARGET {
            &self.records
        } else if *metadata.level() == Level::ERROR {
            &self.errors
        } else {
            return;
        };
        let mut fields = FieldRecorder::default();
        event.record(&mut fields);
        sink.lock().unwrap().push(fields.0);
    }
}

#[derive(Default)]
struct FieldRecorder(HashMap<String, String>);

impl Visit for FieldRecorder {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}
