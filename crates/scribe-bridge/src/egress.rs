// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Egress side: re-encodes buffered records as `Log` entries and ships them in batches.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::ScribeOutputConfig;
use crate::errors::TransportError;
use crate::scribe::{BufferedEvent, LogEntry, Record, ResultCode};

/// An open RPC connection able to deliver `Log` batches.
#[async_trait]
pub trait LogClient: Send {
    /// Sends one `Log` call and returns the remote result code.
    async fn log(&mut self, entries: Vec<LogEntry>) -> Result<ResultCode, TransportError>;

    /// Releases the connection. Called exactly once per opened client.
    async fn close(&mut self);
}

/// Opens [`LogClient`] connections to the remote Scribe server.
#[async_trait]
pub trait Connect: Send + Sync {
    type Client: LogClient;

    async fn connect(&self) -> Result<Self::Client, TransportError>;
}

/// Turns one buffered record into a wire entry.
#[derive(Debug, Clone)]
pub struct ScribeEncoder {
    field_ref: String,
    remove_prefix: Option<String>,
    add_newline: bool,
    default_category: String,
}

impl ScribeEncoder {
    #[must_use]
    pub fn new(config: &ScribeOutputConfig) -> Self {
        ScribeEncoder {
            field_ref: config.field_ref.clone(),
            remove_prefix: config.remove_prefix.clone(),
            add_newline: config.add_newline,
            default_category: config.default_category.clone(),
        }
    }

    /// Returns `None` when the record lacks the configured field.
    pub fn encode(&self, tag: &str, record: &Record) -> Option<LogEntry> {
        let value = record.get(&self.field_ref)?;
        Some(LogEntry {
            category: self.category(tag),
            message: self.message(value),
        })
    }

    fn category(&self, tag: &str) -> String {
        let Some(prefix) = &self.remove_prefix else {
            return tag.to_string();
        };
        if tag == prefix {
            return self.default_category.clone();
        }
        match tag
            .strip_prefix(prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
        {
            Some(rest) if !rest.is_empty() => rest.to_string(),
            _ => tag.to_string(),
        }
    }

    fn message(&self, value: &Value) -> Bytes {
        let mut buf = BytesMut::new();
        match value {
            Value::String(s) => buf.put_slice(s.as_bytes()),
            other => buf.put_slice(other.to_string().as_bytes()),
        }
        if self.add_newline {
            buf.put_u8(b'\n');
        }
        buf.freeze()
    }
}

/// Encodes buffered events and delivers them in `Log` calls of at most
/// `batch_limit` entries over one connection per flush.
pub struct ScribeBatcher<C> {
    encoder: ScribeEncoder,
    batch_limit: usize,
    connector: C,
}

impl<C: Connect> ScribeBatcher<C> {
    #[must_use]
    pub fn new(config: &ScribeOutputConfig, connector: C) -> Self {
        ScribeBatcher {
            encoder: ScribeEncoder::new(config),
            batch_limit: config.batch_limit.max(1),
            connector,
        }
    }

    /// Ships `events` in order. Any failure fails the whole flush; the caller
    /// is expected to retry with the same events.
    pub async fn flush(&self, events: &[BufferedEvent]) -> Result<(), TransportError> {
        let mut client = self.connector.connect().await?;
        let result = self.write(&mut client, events).await;
        client.close().await;
        if let Err(e) = &result {
            error!("Failed to write {} events to scribe: {}", events.len(), e);
        }
        result
    }

    async fn write(
        &self,
        client: &mut C::Client,
        events: &[BufferedEvent],
    ) -> Result<(), TransportError> {
        let mut entries = Vec::with_capacity(self.batch_limit.min(events.len()));
        for event in events {
            let Some(entry) = self.encoder.encode(&event.tag, &event.record) else {
                continue;
            };
            entries.push(entry);

            if entries.len() >= self.batch_limit {
                info!("Writing batch of {} to scribe", self.batch_limit);
                let batch = std::mem::replace(&mut entries, Vec::with_capacity(self.batch_limit));
                Self::send(client, batch).await?;
            }
        }

        if !entries.is_empty() {
            info!("Writing {} entries to scribe", entries.len());
            Self::send(client, entries).await?;
        } else {
            debug!("No remaining entries to write to scribe");
        }
        Ok(())
    }

    async fn send(client: &mut C::Client, batch: Vec<LogEntry>) -> Result<(), TransportError> {
        match client.log(batch).await? {
            ResultCode::Ok => Ok(()),
            code => Err(TransportError::NotOk(code)),
        }
    }
}
