//! Read and write handlers bridging transfers to the filesystem.
//!
//! Every failure is logged with the client's filename before it is handed
//! back to the transport, which turns it into an ERROR packet. When access
//! logging is enabled, one record per transfer is emitted on exit, whatever
//! the outcome.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use tftp::{Handler, IncomingTransfer, OutgoingTransfer, TftpError};
use tokio::fs::{File, OpenOptions};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::path::resolve_path;

/// Target of access-log records, for routing them separately.
pub const ACCESS_LOG_TARGET: &str = "tftpd::access";

/// Serves downloads from and stores uploads under one root.
#[derive(Debug, Clone)]
pub struct FileHandler {
    server: String,
    root: PathBuf,
    access_log: bool,
}

impl FileHandler {
    /// `root` must be absolute and canonical; it is the confinement boundary.
    pub fn new(server: impl Into<String>, root: impl Into<PathBuf>, access_log: bool) -> Self {
        Self {
            server: server.into(),
            root: root.into(),
            access_log,
        }
    }

    async fn send_file(&self, filename: &str, transfer: &mut OutgoingTransfer) -> Result<u64> {
        let path = resolve_path(&self.root, filename).await?;

        let file = File::open(&path).await.map_err(|e| Error::filesystem(filename, e))?;
        let metadata = file.metadata().await.map_err(|e| Error::filesystem(filename, e))?;
        if !metadata.is_file() {
            let err = io::Error::new(io::ErrorKind::InvalidInput, "not a regular file");
            return Err(Error::filesystem(filename, err));
        }
        transfer.set_size(metadata.len());

        transfer.read_from(file).await.map_err(|e| Error::transfer(filename, e))
    }

    async fn receive_file(&self, filename: &str, transfer: &mut IncomingTransfer) -> Result<u64> {
        let path = resolve_path(&self.root, filename).await?;

        // create_new: never replace a file that is already there.
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o644);
        let file = options.open(&path).await.map_err(|e| Error::filesystem(filename, e))?;

        match transfer.write_to(file).await {
            Ok(n) => Ok(n),
            Err(e) => {
                // The partial file is ours; leaving it would block a retry.
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    warn!(server = %self.server, filename, "failed to remove partial upload: {}", remove_err);
                }
                Err(Error::transfer(filename, e))
            }
        }
    }

    fn report(&self, filename: &str, result: Result<u64>) -> std::result::Result<(), TftpError> {
        result.map(|_| ()).map_err(|err| {
            error!(server = %self.server, filename, "{}", err);
            TftpError::from(err)
        })
    }
}

#[async_trait]
impl Handler for FileHandler {
    async fn read(&self, filename: &str, transfer: &mut OutgoingTransfer) -> std::result::Result<(), TftpError> {
        let mut entry = AccessEntry::begin(self, Method::Get, transfer.remote_addr(), filename);
        let result = self.send_file(filename, transfer).await;
        entry.bytes = transfer.bytes_transferred();
        self.report(filename, result)
    }

    async fn write(&self, filename: &str, transfer: &mut IncomingTransfer) -> std::result::Result<(), TftpError> {
        let mut entry = AccessEntry::begin(self, Method::Put, transfer.remote_addr(), filename);
        let result = self.receive_file(filename, transfer).await;
        entry.bytes = transfer.bytes_transferred();
        self.report(filename, result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Get,
    Put,
}

/// One access-log record, emitted when dropped.
struct AccessEntry<'a> {
    enabled: bool,
    server: &'a str,
    method: Method,
    remote: SocketAddr,
    uri: &'a str,
    start: Instant,
    bytes: u64,
}

impl<'a> AccessEntry<'a> {
    fn begin(handler: &'a FileHandler, method: Method, remote: SocketAddr, uri: &'a str) -> Self {
        Self {
            enabled: handler.access_log,
            server: &handler.server,
            method,
            remote,
            uri,
            start: Instant::now(),
            bytes: 0,
        }
    }
}

impl Drop for AccessEntry<'_> {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }

        let duration = self.start.elapsed();
        let remote_ip = self.remote.ip().to_canonical();
        let remote_port = self.remote.port();

        match self.method {
            Method::Get => info!(
                target: ACCESS_LOG_TARGET,
                server = self.server,
                remote_ip = %remote_ip,
                remote_port,
                method = "GET",
                uri = self.uri,
                bytes_written = self.bytes,
                duration = %humantime::format_duration(duration),
                "handled request"
            ),
            Method::Put => info!(
                target: ACCESS_LOG_TARGET,
                server = self.server,
                remote_ip = %remote_ip,
                remote_port,
                method = "PUT",
                uri = self.uri,
                bytes_read = self.bytes,
                duration = %humantime::format_duration(duration),
                "handled request"
            ),
        }
    }
}
