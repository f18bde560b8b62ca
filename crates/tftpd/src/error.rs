//! Error types for provisioning, serving, and individual transfers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tftp::{TftpError, TftpErrorCode};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to load configuration from '{path}': {reason}")]
    ConfigLoad { path: String, reason: String },

    #[error("invalid listen address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("only 'udp' is supported in the listener address, got '{network}'")]
    UnsupportedNetwork { network: String },

    #[error("server '{name}': invalid root '{}': {source}", root.display())]
    InvalidRoot {
        name: String,
        root: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("listener address {address} is used by both '{first}' and '{second}'")]
    DuplicateListener {
        address: String,
        first: String,
        second: String,
    },

    #[error("tftp: failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("unsafe or invalid filename specified")]
    PathRejected { filename: String },

    #[error("{source}")]
    Filesystem {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("transfer failed: {source}")]
    Transfer {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error("server '{name}' failed: {reason}")]
    Serve { name: String, reason: String },

    #[error("tftp app is already started")]
    AlreadyStarted,

    #[error("tftp app has been stopped; provision a new one to serve again")]
    Stopped,
}

impl Error {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_root(name: impl Into<String>, root: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::InvalidRoot {
            name: name.into(),
            root: root.into(),
            source,
        }
    }

    pub fn path_rejected(filename: impl Into<String>) -> Self {
        Self::PathRejected {
            filename: filename.into(),
        }
    }

    pub fn filesystem(filename: impl Into<String>, source: io::Error) -> Self {
        Self::Filesystem {
            filename: filename.into(),
            source,
        }
    }

    pub fn transfer(filename: impl Into<String>, source: io::Error) -> Self {
        Self::Transfer {
            filename: filename.into(),
            source,
        }
    }

    /// Errors that abort provisioning.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. }
                | Self::InvalidAddress { .. }
                | Self::UnsupportedNetwork { .. }
                | Self::InvalidRoot { .. }
                | Self::DuplicateListener { .. }
        )
    }
}

impl From<Error> for TftpError {
    fn from(err: Error) -> Self {
        let code = match &err {
            Error::PathRejected { .. } => TftpErrorCode::AccessViolation,
            Error::Filesystem { source, .. } | Error::Transfer { source, .. } => {
                TftpErrorCode::from_io_kind(source.kind())
            }
            _ => TftpErrorCode::NotDefined,
        };
        TftpError::new(code, err.to_string())
    }
}
