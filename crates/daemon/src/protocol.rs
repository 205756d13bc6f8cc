// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC protocol for broker communication.
//!
//! Wire format: 4-byte length prefix (big-endian) + JSON payload.
//! Clients (test harnesses and emulator children alike) connect, send
//! one request, and read one response.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use broker_core::{BrokerError, EmulatorSpec, ResolveRule};
use broker_engine::{EmulatorView, ProxyView};

/// Request from a client to the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Request {
    /// Health check ping
    Ping,

    /// Register an emulator
    CreateEmulator { emulator: EmulatorSpec },

    /// Fetch one emulator, including its expanded command if started
    GetEmulator { emulator_id: String },

    /// List all emulators
    ListEmulators,

    /// Start an emulator and wait for it to report online
    StartEmulator {
        emulator_id: String,
        /// Caller deadline; combined with the broker's configured
        /// default start deadline.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Callback from an emulator child once it is serving
    ReportEmulatorOnline {
        emulator_id: String,
        resolved_host: String,
        /// Extra patterns merged into the emulator's rule
        #[serde(default)]
        target_patterns: Vec<String>,
    },

    /// Stop an emulator (no-op when offline)
    StopEmulator { emulator_id: String },

    /// Register a standalone resolve rule
    CreateResolveRule { rule: ResolveRule },

    /// Fetch one rule
    GetResolveRule { rule_id: String },

    /// Merge patterns and overwrite scalar fields of a rule
    UpdateResolveRule { rule: ResolveRule },

    /// List all rules
    ListResolveRules,

    /// Resolve a target to a concrete endpoint
    Resolve {
        target: String,
        /// Caller deadline for any on-demand start this triggers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Create the TCP proxy for an emulator (port 0 = broker picks)
    CreateProxy {
        emulator_id: String,
        #[serde(default)]
        port: u16,
    },

    /// Fetch one proxy
    GetProxy { emulator_id: String },

    /// List all proxies
    ListProxies,

    /// Request broker shutdown
    Shutdown,
}

/// Response from the broker to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Response {
    /// Generic success
    Ok,

    /// Health check response
    Pong,

    /// Single emulator details
    Emulator { emulator: Box<EmulatorView> },

    /// List of emulators
    Emulators { emulators: Vec<EmulatorView> },

    /// Single rule details
    Rule { rule: ResolveRule },

    /// List of rules
    Rules { rules: Vec<ResolveRule> },

    /// Resolve result
    Resolved {
        target: String,
        requires_secure_connection: bool,
    },

    /// Single proxy details
    Proxy { proxy: ProxyView },

    /// List of proxies
    Proxies { proxies: Vec<ProxyView> },

    /// Broker is shutting down
    ShuttingDown,

    /// Error response carrying the RPC status code string
    Error { code: String, message: String },
}

impl Response {
    /// Map a broker error onto the wire.
    pub fn error(e: &BrokerError) -> Self {
        Response::Error {
            code: e.code().to_string(),
            message: e.to_string(),
        }
    }
}

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Default socket I/O timeout
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Protocol version (from Cargo.toml)
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Encode a message to JSON bytes (without length prefix)
///
/// Use with `write_message()` which handles the length-prefix wire format.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;

    if json.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: json.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    Ok(json)
}

/// Decode a message from wire format
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read a length-prefixed message from an async reader
pub async fn read_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, ProtocolError> {
    // Read length prefix
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(ProtocolError::Io(e)),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    // Read payload
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Write a length-prefixed message to an async writer
pub async fn write_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let len = data.len();
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a request with timeout
pub async fn read_request<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
    timeout: std::time::Duration,
) -> Result<Request, ProtocolError> {
    let bytes = tokio::time::timeout(timeout, read_message(reader))
        .await
        .map_err(|_| ProtocolError::Timeout)??;
    decode(&bytes)
}

/// Write a response with timeout
pub async fn write_response<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &Response,
    timeout: std::time::Duration,
) -> Result<(), ProtocolError> {
    let data = encode(response)?;
    tokio::time::timeout(timeout, write_message(writer, &data))
        .await
        .map_err(|_| ProtocolError::Timeout)?
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
