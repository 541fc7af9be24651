// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingress handler: turns `Log` batches into tag-keyed records.
//!
//! Every message of a batch is decoded according to the configured format and
//! grouped by its effective tag. Once the whole batch decoded, each tag's
//! records are emitted to the sink in one call, in order of first appearance.
//! The batch is answered with a single result code.

use fnv::FnvHashMap;
use tracing::{debug, error, warn};

use crate::config::{Format, ScribeInputConfig};
use crate::errors::{DecodeError, SinkError};
use crate::format::decode;
use crate::scribe::{now_unix, LogEntry, Record, ResultCode, Timestamp};

/// A record paired with the time it was received.
pub type TimedRecord = (Timestamp, Record);

/// Anything that can answer a Scribe `Log` call.
///
/// Invoked concurrently from every connection the server is serving.
pub trait BatchLogHandler: Send + Sync {
    fn log(&self, messages: Vec<LogEntry>) -> ResultCode;
}

/// Downstream pipeline receiving decoded records.
///
/// Implementations must tolerate concurrent calls.
pub trait EventSink: Send + Sync {
    fn emit(&self, tag: &str, events: Vec<TimedRecord>) -> Result<(), SinkError>;
}

/// Records of one batch grouped by tag, in order of first appearance.
#[derive(Debug, Default)]
struct EmitBucket {
    index: FnvHashMap<String, usize>,
    tags: Vec<(String, Vec<TimedRecord>)>,
}

impl EmitBucket {
    fn push(&mut self, tag: String, event: TimedRecord) {
        match self.index.get(&tag) {
            Some(&i) => self.tags[i].1.push(event),
            None => {
                self.index.insert(tag.clone(), self.tags.len());
                self.tags.push((tag, vec![event]));
            }
        }
    }

    fn into_tags(self) -> Vec<(String, Vec<TimedRecord>)> {
        self.tags
    }
}

/// Why a batch was answered with `TRY_LATER`.
#[derive(Debug)]
enum BatchFailure {
    Decode(DecodeError),
    Sink(SinkError),
}

/// Maps the outcome of a batch to the result code sent back to the client.
fn result_code(outcome: &Result<(), BatchFailure>) -> ResultCode {
    match outcome {
        Ok(()) => ResultCode::Ok,
        Err(BatchFailure::Decode(_)) | Err(BatchFailure::Sink(_)) => ResultCode::TryLater,
    }
}

/// Decodes `Log` batches and forwards them to an [`EventSink`].
pub struct ScribeHandler<S> {
    add_prefix: Option<String>,
    remove_newline: bool,
    msg_format: Format,
    ignore_invalid_record: bool,
    sink: S,
}

impl<S: EventSink> ScribeHandler<S> {
    #[must_use]
    pub fn new(config: &ScribeInputConfig, sink: S) -> Self {
        ScribeHandler {
            add_prefix: config.add_prefix.clone(),
            remove_newline: config.remove_newline,
            msg_format: config.msg_format,
            ignore_invalid_record: config.ignore_invalid_record,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Handles one batch, stamping every record with `timestamp`.
    pub fn handle_batch_at(&self, messages: Vec<LogEntry>, timestamp: Timestamp) -> ResultCode {
        let outcome = self.transcode(messages, timestamp);
        match &outcome {
            Ok(()) => {}
            Err(BatchFailure::Decode(e)) => {
                error!("Failed to decode Scribe batch, answering TRY_LATER: {}", e);
            }
            Err(BatchFailure::Sink(e)) => {
                error!("Failed to emit Scribe batch, answering TRY_LATER: {}", e);
            }
        }
        result_code(&outcome)
    }

    fn transcode(&self, messages: Vec<LogEntry>, timestamp: Timestamp) -> Result<(), BatchFailure> {
        let n_messages = messages.len();
        let mut bucket = EmitBucket::default();

        for msg in messages {
            let record = match decode(&msg.message, self.msg_format, self.remove_newline) {
                Ok(record) => record,
                Err(e) if self.ignore_invalid_record => {
                    warn!(
                        "Got invalid record in category '{}': {} (message: {:?})",
                        msg.category,
                        e,
                        String::from_utf8_lossy(&msg.message)
                    );
                    continue;
                }
                Err(e) => return Err(BatchFailure::Decode(e)),
            };
            bucket.push(self.effective_tag(&msg.category), (timestamp, record));
        }

        let tags = bucket.into_tags();
        debug!(
            "Emitting {} messages under {} tags",
            n_messages,
            tags.len()
        );
        // Tags emitted before a failure are not rolled back
        for (tag, events) in tags {
            self.sink.emit(&tag, events).map_err(BatchFailure::Sink)?;
        }
        Ok(())
    }

    fn effective_tag(&self, category: &str) -> String {
        match &self.add_prefix {
            Some(prefix) => format!("{prefix}.{category}"),
            None => category.to_string(),
        }
    }
}

impl<S: EventSink> BatchLogHandler for ScribeHandler<S> {
    fn log(&self, messages: Vec<LogEntry>) -> ResultCode {
        self.handle_batch_at(messages, now_unix())
    }
}
