// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP client for remote Scribe servers: framed transport, non-strict binary protocol.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::config::{ScribeOutputConfig, DEFAULT_BODY_SIZE_LIMIT};
use crate::egress::{Connect, LogClient};
use crate::errors::{ProtocolError, TransportError};
use crate::scribe::{LogEntry, ResultCode};
use crate::thrift::{Call, ClientCodec, Framing, Reply};

/// Opens [`ThriftClient`] connections to `host:port`.
#[derive(Debug, Clone)]
pub struct ThriftConnector {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ThriftConnector {
    pub fn new(config: &ScribeOutputConfig) -> Self {
        ThriftConnector {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout_duration(),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Connect for ThriftConnector {
    type Client = ThriftClient;

    async fn connect(&self) -> Result<ThriftClient, TransportError> {
        let addr = self.addr();
        let stream = match timeout(self.timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
            Err(_) => return Err(TransportError::Timeout(self.timeout)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", addr, e);
        }
        trace!("Connected to scribe at {}", addr);

        Ok(ThriftClient {
            framed: Framed::new(
                stream,
                ClientCodec::new(Framing::Framed, DEFAULT_BODY_SIZE_LIMIT),
            ),
            seqid: 0,
            timeout: self.timeout,
        })
    }
}

/// One open connection to a remote Scribe server.
pub struct ThriftClient {
    framed: Framed<TcpStream, ClientCodec>,
    seqid: i32,
    timeout: Duration,
}

#[async_trait]
impl LogClient for ThriftClient {
    async fn log(&mut self, entries: Vec<LogEntry>) -> Result<ResultCode, TransportError> {
        self.seqid = self.seqid.wrapping_add(1);
        let sent = self.seqid;

        timeout(
            self.timeout,
            self.framed.send(Call::Log {
                seqid: sent,
                entries,
            }),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.timeout))??;

        let reply = timeout(self.timeout, self.framed.next())
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))?
            .ok_or(TransportError::Closed)??;

        match reply {
            Reply::Log { seqid, code } if seqid == sent => Ok(code),
            Reply::Exception { message, .. } => {
                Err(ProtocolError::Application(message).into())
            }
            other => Err(TransportError::SeqIdMismatch {
                sent,
                received: other.seqid(),
            }),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!("Failed to shut down scribe connection: {}", e);
        }
    }
}
