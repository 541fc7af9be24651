// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the ingress and egress sides of the bridge.

/// Invalid configuration, detected once at construction time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported msg_format: {0}")]
    UnsupportedFormat(String),

    #[error("unsupported server_type '{0}'")]
    UnsupportedServerType(String),

    #[error("invalid size '{0}'")]
    InvalidSize(String),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A single message payload could not be turned into a record.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body must be a Hash, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid percent-encoding in '{0}'")]
    PercentEncoding(String),
}

/// The downstream pipeline refused a batch of events.
#[derive(Debug, thiserror::Error)]
#[error("failed to emit events for tag '{tag}': {reason}")]
pub struct SinkError {
    pub tag: String,
    pub reason: String,
}

/// Malformed or unsupported bytes on the Thrift wire.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("bad protocol version: {0:#x}")]
    BadVersion(u32),

    #[error("invalid message type {0}")]
    InvalidMessageType(u8),

    #[error("invalid field type {0}")]
    InvalidFieldType(u8),

    #[error("negative size {0}")]
    NegativeSize(i32),

    #[error("message of {size} bytes exceeds the body size limit of {limit} bytes")]
    SizeLimit { size: usize, limit: usize },

    #[error("unknown result code {0}")]
    UnknownResultCode(i32),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("message truncated")]
    Truncated,

    #[error("structure nested deeper than {0} levels")]
    DepthLimit(usize),

    #[error("remote application exception: {0}")]
    Application(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The egress RPC connection failed or the remote refused a batch.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed by remote")]
    Closed,

    #[error("sequence id mismatch: sent {sent}, received {received}")]
    SeqIdMismatch { sent: i32, received: i32 },

    #[error("remote answered {0}")]
    NotOk(crate::scribe::ResultCode),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Protocol(ProtocolError::Io(e))
    }
}
