//! Async TFTP transport
//!
//! Implements the wire side of TFTP (RFC 1350) with option negotiation
//! (RFC 2347, 2348, 2349) and hands each request to a [`Handler`]:
//!
//! - [`Packet`] framing and the protocol enums ([`TftpOpcode`], [`TftpErrorCode`], [`TransferMode`])
//! - [`OutgoingTransfer`] / [`IncomingTransfer`], the byte streams a handler drives
//! - [`Server`], the accept loop with cooperative shutdown
//!
//! # Basic Server Usage
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use tftp::{Handler, IncomingTransfer, OutgoingTransfer, Server, TftpError, TftpErrorCode};
//! use tokio::net::UdpSocket;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn read(&self, _filename: &str, transfer: &mut OutgoingTransfer) -> Result<(), TftpError> {
//!         transfer.read_from(&b"hello"[..]).await?;
//!         Ok(())
//!     }
//!
//!     async fn write(&self, _filename: &str, _transfer: &mut IncomingTransfer) -> Result<(), TftpError> {
//!         Err(TftpError::with_default_message(TftpErrorCode::AccessViolation))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(Hello);
//!     server.serve(UdpSocket::bind("127.0.0.1:6969").await?).await
//! }
//! ```

mod protocol;
mod server;
mod transfer;

pub use protocol::*;
pub use server::*;
pub use transfer::{IncomingTransfer, OutgoingTransfer, TransferConfig};
