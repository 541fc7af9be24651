// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scribe protocol data types shared by both bridge directions.

use bytes::Bytes;
use derive_more::Display;

/// A structured record: string keys mapped to JSON values.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Unix timestamp in seconds.
pub type Timestamp = i64;

/// One `(category, message)` pair of a `Log` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub category: String,
    pub message: Bytes,
}

impl LogEntry {
    pub fn new(category: impl Into<String>, message: impl Into<Bytes>) -> Self {
        LogEntry {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Outcome of a `Log` call. `Error` exists in the protocol but the ingress
/// side never answers with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ResultCode {
    #[display("OK")]
    Ok,
    #[display("TRY_LATER")]
    TryLater,
    #[display("ERROR")]
    Error,
}

impl ResultCode {
    pub fn as_i32(self) -> i32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::TryLater => 1,
            ResultCode::Error => 2,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(ResultCode::Ok),
            1 => Some(ResultCode::TryLater),
            2 => Some(ResultCode::Error),
            _ => None,
        }
    }
}

/// A tag-keyed record handed over by the upstream buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedEvent {
    pub tag: String,
    pub timestamp: Timestamp,
    pub record: Record,
}

impl BufferedEvent {
    pub fn new(tag: impl Into<String>, timestamp: Timestamp, record: Record) -> Self {
        BufferedEvent {
            tag: tag.into(),
            timestamp,
            record,
        }
    }
}

/// Current wall clock time in Unix seconds.
pub fn now_unix() -> Timestamp {
    std::time::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default()
        .try_into()
        .unwrap_or_default()
}
