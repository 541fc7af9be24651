// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory event buffer between the ingress handler and the egress batcher.
//!
//! The buffer runs as a service task owning the queue; producers and the drain
//! loop talk to it through a cloneable [`BufferHandle`].

use std::collections::VecDeque;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::errors::SinkError;
use crate::ingress::{EventSink, TimedRecord};
use crate::scribe::BufferedEvent;

#[derive(Debug)]
pub enum BufferCommand {
    Emit(String, Vec<TimedRecord>),
    Drain(oneshot::Sender<Vec<BufferedEvent>>),
    Requeue(Vec<BufferedEvent>),
    Len(oneshot::Sender<usize>),
    Shutdown,
}

#[derive(Clone)]
pub struct BufferHandle {
    tx: mpsc::UnboundedSender<BufferCommand>,
}

impl BufferHandle {
    /// Takes every queued event, oldest first.
    pub async fn drain(&self) -> Result<Vec<BufferedEvent>, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Drain(response_tx))
            .map_err(|e| format!("Failed to send drain command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive drain response: {}", e))
    }

    /// Puts events from a failed flush back in front of the queue.
    pub fn requeue(
        &self,
        events: Vec<BufferedEvent>,
    ) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::Requeue(events))
    }

    pub async fn len(&self) -> Result<usize, String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Len(response_tx))
            .map_err(|e| format!("Failed to send len command: {}", e))?;

        response_rx
            .await
            .map_err(|e| format!("Failed to receive len response: {}", e))
    }

    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<BufferCommand>> {
        self.tx.send(BufferCommand::Shutdown)
    }
}

impl EventSink for BufferHandle {
    fn emit(&self, tag: &str, events: Vec<TimedRecord>) -> Result<(), SinkError> {
        self.tx
            .send(BufferCommand::Emit(tag.to_string(), events))
            .map_err(|_| SinkError {
                tag: tag.to_string(),
                reason: "event buffer is shut down".to_string(),
            })
    }
}

pub struct BufferService {
    queue: VecDeque<BufferedEvent>,
    max_events: usize,
    rx: mpsc::UnboundedReceiver<BufferCommand>,
}

impl BufferService {
    /// Creates the service and its handle. At most `max_events` are kept;
    /// the oldest ones are dropped beyond that.
    pub fn new(max_events: usize) -> (Self, BufferHandle) {
        let (tx, rx) = mpsc::unbounded_channel();

        let service = Self {
            queue: VecDeque::new(),
            max_events,
            rx,
        };

        let handle = BufferHandle { tx };

        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Buffer service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                BufferCommand::Emit(tag, events) => {
                    self.queue
                        .extend(events.into_iter().map(|(timestamp, record)| BufferedEvent {
                            tag: tag.clone(),
                            timestamp,
                            record,
                        }));
                    self.evict();
                }

                BufferCommand::Drain(response_tx) => {
                    let events: Vec<BufferedEvent> = self.queue.drain(..).collect();
                    if let Err(events) = response_tx.send(events) {
                        error!("Failed to send drain response - receiver dropped");
                        self.queue.extend(events);
                    }
                }

                BufferCommand::Requeue(events) => {
                    for event in events.into_iter().rev() {
                        self.queue.push_front(event);
                    }
                    self.evict();
                }

                BufferCommand::Len(response_tx) => {
                    if response_tx.send(self.queue.len()).is_err() {
                        error!("Failed to send len response - receiver dropped");
                    }
                }

                BufferCommand::Shutdown => {
                    debug!("Buffer service shutting down");
                    break;
                }
            }
        }

        debug!("Buffer service stopped with {} events queued", self.queue.len());
    }

    fn evict(&mut self) {
        let overflow = self.queue.len().saturating_sub(self.max_events);
        if overflow > 0 {
            self.queue.drain(..overflow);
            warn!(
                "Event buffer full ({} events), dropped {} oldest events",
                self.max_events, overflow
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scribe::Record;
    use serde_json::json;
    use tracing_test::traced_test;

    fn message(text: &str) -> Record {
        json!({ "message": text })
            .as_object()
            .expect("object literal")
            .clone()
    }

    fn tags(events: &[BufferedEvent]) -> Vec<(&str, i64)> {
        events.iter().map(|e| (e.tag.as_str(), e.timestamp)).collect()
    }

    #[tokio::test]
    async fn test_buffer_service_basic_flow() {
        let (service, handle) = BufferService::new(100);
        let service_task = tokio::spawn(service.run());

        handle
            .emit("a", vec![(1, message("1")), (1, message("2"))])
            .expect("emit failed");
        handle.emit("b", vec![(2, message("3"))]).expect("emit failed");

        assert_eq!(handle.len().await.expect("len failed"), 3);
        let events = handle.drain().await.expect("drain failed");
        assert_eq!(tags(&events), vec![("a", 1), ("a", 1), ("b", 2)]);
        assert_eq!(events[2].record, message("3"));
        assert!(handle.drain().await.expect("drain failed").is_empty());

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_requeue_goes_in_front() {
        let (service, handle) = BufferService::new(100);
        let service_task = tokio::spawn(service.run());

        handle.emit("a", vec![(1, message("1"))]).expect("emit failed");
        let failed = handle.drain().await.expect("drain failed");
        handle.emit("b", vec![(2, message("2"))]).expect("emit failed");
        handle.requeue(failed).expect("requeue failed");

        let events = handle.drain().await.expect("drain failed");
        assert_eq!(tags(&events), vec![("a", 1), ("b", 2)]);

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_overflow_drops_oldest() {
        let (service, handle) = BufferService::new(2);
        let service_task = tokio::spawn(service.run());

        handle
            .emit("a", vec![(1, message("1")), (2, message("2")), (3, message("3"))])
            .expect("emit failed");

        let events = handle.drain().await.expect("drain failed");
        assert_eq!(tags(&events), vec![("a", 2), ("a", 3)]);
        assert!(logs_contain("dropped 1 oldest events"));

        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_is_a_sink_error() {
        let (service, handle) = BufferService::new(10);
        let service_task = tokio::spawn(service.run());
        handle.shutdown().expect("Failed to shutdown");
        service_task.await.expect("Service task failed");

        let err = handle.emit("a", vec![(1, message("1"))]).unwrap_err();
        assert_eq!(err.tag, "a");
    }
}
