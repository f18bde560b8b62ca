//! TFTP Protocol Implementation
//!
//! Packet framing for RFC 1350 plus the option extension (RFC 2347) and the
//! `blksize`/`tsize`/`timeout` options (RFC 2348, RFC 2349).
//!
//! Every datagram is represented by a [`Packet`]. Parsing is strict about
//! framing (opcodes, NUL terminators, UTF-8) and lenient about content:
//! unknown options are preserved so the transfer layer can decide what to
//! acknowledge.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};

/// TFTP Protocol Opcodes
///
/// The first two bytes of every packet, in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpOpcode {
    /// Read Request: | 1 | Filename | 0 | Mode | 0 | \[Options\] |
    ReadRequest = 1,
    /// Write Request: | 2 | Filename | 0 | Mode | 0 | \[Options\] |
    WriteRequest = 2,
    /// Data: | 3 | Block# | Data |
    Data = 3,
    /// Acknowledgment: | 4 | Block# |
    ///
    /// Block 0 acknowledges an OACK (for reads) or accepts a WRQ.
    Acknowledgment = 4,
    /// Error: | 5 | ErrorCode | ErrMsg | 0 |
    Error = 5,
    /// Option Acknowledgment: | 6 | Opt1 | 0 | Value1 | 0 | ... |
    OptionAck = 6,
}

impl TftpOpcode {
    /// Convert a u16 value to a TftpOpcode
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpOpcode;
    ///
    /// assert_eq!(TftpOpcode::from_u16(2), Some(TftpOpcode::WriteRequest));
    /// assert_eq!(TftpOpcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the human-readable name of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl fmt::Display for TftpOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// TFTP Error Codes
///
/// Standard codes from RFC 1350, plus code 8 from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TftpErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl TftpErrorCode {
    /// Convert a u16 value to a TftpErrorCode
    ///
    /// Codes outside the known range collapse to [`TftpErrorCode::NotDefined`].
    ///
    /// # Examples
    /// ```
    /// use tftp::TftpErrorCode;
    ///
    /// assert_eq!(TftpErrorCode::from_u16(6), TftpErrorCode::FileAlreadyExists);
    /// assert_eq!(TftpErrorCode::from_u16(99), TftpErrorCode::NotDefined);
    /// ```
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTransferId,
            6 => Self::FileAlreadyExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiationFailed,
            _ => Self::NotDefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Pick the protocol code a client should see for a local I/O failure.
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => Self::FileNotFound,
            io::ErrorKind::PermissionDenied => Self::AccessViolation,
            io::ErrorKind::StorageFull => Self::DiskFull,
            io::ErrorKind::AlreadyExists => Self::FileAlreadyExists,
            _ => Self::NotDefined,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl fmt::Display for TftpErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Transfer modes named in a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferMode {
    Octet,
    NetAscii,
}

impl TransferMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::NetAscii => "netascii",
        }
    }

    /// Files are served as raw bytes only.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::Octet)
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Ok(Self::Octet),
            "netascii" => Ok(Self::NetAscii),
            _ => Err(format!("Unsupported transfer mode: {}", s)),
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block size negotiation (RFC 2348)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizeConfig {
    pub size: usize,
}

impl BlockSizeConfig {
    pub const DEFAULT: usize = 512;

    /// Keeps a DATA packet inside a typical Ethernet MTU.
    pub const MAX: usize = 1400;

    /// Parse a `blksize` value, clamping to [`Self::MAX`] and falling back to
    /// [`Self::DEFAULT`] on garbage or zero.
    pub fn from_option(value: &str) -> Self {
        let size = value
            .parse::<usize>()
            .ok()
            .map(|n| n.min(Self::MAX))
            .filter(|&n| n > 0)
            .unwrap_or(Self::DEFAULT);

        Self { size }
    }
}

impl Default for BlockSizeConfig {
    fn default() -> Self {
        Self { size: Self::DEFAULT }
    }
}

/// A read or write request.
#[derive(Debug, Clone, PartialEq)]
pub struct TftpRequest {
    pub opcode: TftpOpcode,
    pub filename: String,
    /// Mode as sent by the client, lower-cased.
    pub mode: String,
    /// Options keyed by lower-cased name.
    pub options: HashMap<String, String>,
}

impl TftpRequest {
    pub fn read(filename: impl Into<String>) -> Self {
        Self::new(TftpOpcode::ReadRequest, filename)
    }

    pub fn write(filename: impl Into<String>) -> Self {
        Self::new(TftpOpcode::WriteRequest, filename)
    }

    fn new(opcode: TftpOpcode, filename: impl Into<String>) -> Self {
        Self {
            opcode,
            filename: filename.into(),
            mode: TransferMode::Octet.as_str().to_string(),
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into().to_ascii_lowercase(), value.into());
        self
    }
}

/// An error reported to or received from a peer.
///
/// This is also the error type transfer handlers return: the code decides
/// what the client sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TftpError {
    pub code: TftpErrorCode,
    pub message: String,
}

impl TftpError {
    pub fn new(code: TftpErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn with_default_message(code: TftpErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}

impl fmt::Display for TftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for TftpError {}

impl From<io::Error> for TftpError {
    fn from(err: io::Error) -> Self {
        Self::new(TftpErrorCode::from_io_kind(err.kind()), err.to_string())
    }
}

/// One TFTP datagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Request(TftpRequest),
    Data { block: u16, data: Vec<u8> },
    Ack(u16),
    Error(TftpError),
    OptionAck(HashMap<String, String>),
}

impl Packet {
    pub fn opcode(&self) -> TftpOpcode {
        match self {
            Self::Request(request) => request.opcode,
            Self::Data { .. } => TftpOpcode::Data,
            Self::Ack(_) => TftpOpcode::Acknowledgment,
            Self::Error(_) => TftpOpcode::Error,
            Self::OptionAck(_) => TftpOpcode::OptionAck,
        }
    }

    /// Decode a datagram.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let opcode = get_tftp_opcode(buf).ok_or_else(|| anyhow!("missing or unknown opcode"))?;
        let body = &buf[2..];

        match opcode {
            TftpOpcode::ReadRequest | TftpOpcode::WriteRequest => parse_request(opcode, body).map(Self::Request),
            TftpOpcode::Data => {
                let block = read_u16(body).ok_or_else(|| anyhow!("DATA too short"))?;
                Ok(Self::Data {
                    block,
                    data: body[2..].to_vec(),
                })
            }
            TftpOpcode::Acknowledgment => read_u16(body)
                .map(Self::Ack)
                .ok_or_else(|| anyhow!("ACK too short")),
            TftpOpcode::Error => {
                let code = read_u16(body).ok_or_else(|| anyhow!("ERROR too short"))?;
                // Some clients omit the terminator; take whatever is there.
                let text = &body[2..];
                let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
                let message = String::from_utf8_lossy(&text[..end]).into_owned();
                Ok(Self::Error(TftpError::new(TftpErrorCode::from_u16(code), message)))
            }
            TftpOpcode::OptionAck => {
                let mut fields = NulFields::new(body);
                let mut options = HashMap::new();
                while let Some(key) = fields.next_field()? {
                    let value = fields.next_field()?.ok_or_else(|| anyhow!("option '{}' has no value", key))?;
                    options.insert(key.to_ascii_lowercase(), value.to_string());
                }
                Ok(Self::OptionAck(options))
            }
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.encoded_len_hint());
        v.extend_from_slice(&self.opcode().as_u16().to_be_bytes());

        match self {
            Self::Request(request) => {
                put_str(&mut v, &request.filename);
                put_str(&mut v, &request.mode);
                for (key, val) in &request.options {
                    put_str(&mut v, key);
                    put_str(&mut v, val);
                }
            }
            Self::Data { block, data } => {
                v.extend_from_slice(&block.to_be_bytes());
                v.extend_from_slice(data);
            }
            Self::Ack(block) => v.extend_from_slice(&block.to_be_bytes()),
            Self::Error(err) => {
                v.extend_from_slice(&err.code.as_u16().to_be_bytes());
                put_str(&mut v, &err.message);
            }
            Self::OptionAck(options) => {
                for (key, val) in options {
                    put_str(&mut v, key);
                    put_str(&mut v, val);
                }
            }
        }

        v
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::Data { data, .. } => 4 + data.len(),
            Self::Ack(_) => 4,
            _ => 64,
        }
    }
}

pub fn get_tftp_opcode(buf: &[u8]) -> Option<TftpOpcode> {
    read_u16(buf).and_then(TftpOpcode::from_u16)
}

fn parse_request(opcode: TftpOpcode, body: &[u8]) -> Result<TftpRequest> {
    let mut fields = NulFields::new(body);

    let filename = fields.next_field()?.ok_or_else(|| anyhow!("filename not terminated"))?;
    let mode = fields.next_field()?.ok_or_else(|| anyhow!("mode not terminated"))?;

    let mut options = HashMap::new();
    while let Some(key) = fields.next_field()? {
        // A trailing key without a value is tolerated and dropped.
        let Some(value) = fields.next_field()? else { break };
        options.insert(key.to_ascii_lowercase(), value.to_string());
    }

    Ok(TftpRequest {
        opcode,
        filename: filename.to_string(),
        mode: mode.to_ascii_lowercase(),
        options,
    })
}

fn read_u16(buf: &[u8]) -> Option<u16> {
    match buf {
        [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn put_str(v: &mut Vec<u8>, s: &str) {
    v.extend_from_slice(s.as_bytes());
    v.push(0);
}

/// Iterator over NUL-terminated UTF-8 fields.
struct NulFields<'a> {
    buf: &'a [u8],
}

impl<'a> NulFields<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// `Ok(None)` once the buffer is exhausted; an error for an unterminated field.
    fn next_field(&mut self) -> Result<Option<&'a str>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let Some(end) = self.buf.iter().position(|&b| b == 0) else {
            bail!("field not terminated");
        };
        let field = std::str::from_utf8(&self.buf[..end])?;
        self.buf = &self.buf[end + 1..];
        Ok(Some(field))
    }
}
