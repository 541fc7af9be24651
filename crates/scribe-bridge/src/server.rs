// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scribe server implementation for receiving `Log` calls.
//!
//! This module accepts TCP connections from Scribe clients, decodes Thrift `Log` calls with
//! the configured framing, hands every batch to a [`BatchLogHandler`] and answers with the
//! handler's result code. How connections are scheduled depends on the configured
//! [`ServerType`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::{ScribeInputConfig, ServerType};
use crate::errors::ProtocolError;
use crate::ingress::BatchLogHandler;
use crate::scribe::{LogEntry, ResultCode};
use crate::thrift::{Call, Framing, Reply, ServerCodec, UNKNOWN_METHOD};

/// Number of connections served at once by the `thread_pool` server type.
pub const THREAD_POOL_SIZE: usize = 20;

/// Scribe server to receive `Log` calls and dispatch them to a handler.
pub struct ScribeServer {
    cancel_token: CancellationToken,
    handler: Arc<dyn BatchLogHandler>,
    listener: TcpListener,
    server_type: ServerType,
    codec: ServerCodec,
}

impl ScribeServer {
    /// Creates a new server bound to `bind:port`.
    ///
    /// Calls received are handed to `handler`; the accept loop stops once
    /// `cancel_token` is cancelled.
    pub async fn new(
        config: &ScribeInputConfig,
        handler: Arc<dyn BatchLogHandler>,
        cancel_token: CancellationToken,
    ) -> io::Result<ScribeServer> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        debug!(
            "Listening scribe on {} ({}, framed: {})",
            listener.local_addr()?,
            config.server_type,
            config.is_framed
        );

        Ok(ScribeServer {
            cancel_token,
            handler,
            listener,
            server_type: config.server_type,
            codec: ServerCodec::new(
                Framing::from_is_framed(config.is_framed),
                config.body_size_limit,
            ),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Main accept loop. Returns once the cancel token fires and every
    /// connection in service has finished.
    pub async fn spin(self) {
        let pool = Arc::new(Semaphore::new(THREAD_POOL_SIZE));
        let mut connections = JoinSet::new();

        loop {
            let permit = if self.server_type == ServerType::ThreadPool {
                tokio::select! {
                    permit = Arc::clone(&pool).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = self.cancel_token.cancelled() => break,
                }
            } else {
                None
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept scribe connection: {}", e);
                        continue;
                    }
                },
                _ = self.cancel_token.cancelled() => break,
            };
            trace!("Accepted scribe connection from {}", peer);

            let connection = Connection {
                handler: Arc::clone(&self.handler),
                codec: self.codec.clone(),
                cancel_token: self.cancel_token.clone(),
                blocking_handler: self.server_type == ServerType::Threaded,
            };

            match self.server_type {
                ServerType::Simple => connection.serve(stream, peer).await,
                ServerType::Threaded | ServerType::Nonblocking | ServerType::ThreadPool => {
                    connections.spawn(async move {
                        connection.serve(stream, peer).await;
                        drop(permit);
                    });
                }
            }

            // reap finished connections
            while connections.try_join_next().is_some() {}
        }

        debug!("Scribe server stopped accepting connections");
        while connections.join_next().await.is_some() {}
    }
}

/// One client connection and everything needed to answer it.
struct Connection {
    handler: Arc<dyn BatchLogHandler>,
    codec: ServerCodec,
    cancel_token: CancellationToken,
    blocking_handler: bool,
}

impl Connection {
    async fn serve(self, stream: TcpStream, peer: SocketAddr) {
        let mut framed = Framed::new(stream, self.codec.clone());
        loop {
            let call = tokio::select! {
                next = framed.next() => next,
                _ = self.cancel_token.cancelled() => break,
            };
            let reply = match call {
                None => break,
                Some(Ok(call)) => self.dispatch(call).await,
                Some(Err(ProtocolError::Io(e))) => {
                    debug!("Scribe connection from {} closed: {}", peer, e);
                    break;
                }
                Some(Err(e)) => {
                    error!("Invalid scribe request from {}: {}", peer, e);
                    break;
                }
            };
            if let Err(e) = framed.send(reply).await {
                error!("Failed to answer scribe client {}: {}", peer, e);
                break;
            }
        }
        trace!("Scribe connection from {} finished", peer);
    }

    async fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::Log { seqid, entries } => {
                trace!("Received {} scribe messages (seqid {})", entries.len(), seqid);
                let code = self.handle(entries).await;
                Reply::Log { seqid, code }
            }
            Call::Unknown { name, seqid } => {
                debug!("Unknown scribe method '{}'", name);
                Reply::Exception {
                    message: format!("Unknown function {name}"),
                    name,
                    seqid,
                    kind: UNKNOWN_METHOD,
                }
            }
        }
    }

    async fn handle(&self, entries: Vec<LogEntry>) -> ResultCode {
        if !self.blocking_handler {
            return self.handler.log(entries);
        }
        let handler = Arc::clone(&self.handler);
        match tokio::task::spawn_blocking(move || handler.log(entries)).await {
            Ok(code) => code,
            Err(e) => {
                error!("Scribe handler task failed: {}", e);
                ResultCode::TryLater
            }
        }
    }
}
