// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, future::Future, io, sync::Arc};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use scribe_bridge::{
    buffer_service::{BufferHandle, BufferService},
    client::ThriftConnector,
    config::{ScribeInputConfig, ScribeOutputConfig},
    egress::ScribeBatcher,
    ingress::ScribeHandler,
    server::ScribeServer,
};

const DEFAULT_FLUSH_INTERVAL: u64 = 10;
const DEFAULT_BUFFER_MAX_EVENTS: usize = 1_000_000;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SCRIBE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let input_config = match ScribeInputConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error reading scribe input configuration: {e}");
            return;
        }
    };
    let output_config = match ScribeOutputConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error reading scribe output configuration: {e}");
            return;
        }
    };
    let flush_interval = env::var("SCRIBE_FLUSH_INTERVAL")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_FLUSH_INTERVAL);
    let max_events = env::var("SCRIBE_BUFFER_MAX_EVENTS")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(DEFAULT_BUFFER_MAX_EVENTS);

    let (service, buffer) = BufferService::new(max_events);
    let buffer_task = tokio::spawn(service.run());

    let cancel_token = CancellationToken::new();
    let handler = Arc::new(ScribeHandler::new(&input_config, buffer.clone()));
    let server = match ScribeServer::new(&input_config, handler, cancel_token.clone()).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start scribe server on {}: {e}", input_config.listen_addr());
            return;
        }
    };
    info!("scribe: starting to listen on {}", input_config.listen_addr());
    let server_task = tokio::spawn(server.spin());

    let batcher = ScribeBatcher::new(&output_config, ThriftConnector::new(&output_config));
    info!(
        "scribe: relaying to {}:{} every {}s",
        output_config.host, output_config.port, flush_interval
    );

    flush_until(
        tokio::signal::ctrl_c(),
        Duration::from_secs(flush_interval),
        &buffer,
        &batcher,
    )
    .await;

    cancel_token.cancel();
    if let Err(e) = server_task.await {
        error!("Scribe server task failed: {e}");
    }
    flush(&buffer, &batcher).await;
    if buffer.shutdown().is_ok() {
        if let Err(e) = buffer_task.await {
            error!("Buffer service task failed: {e}");
        }
    }
}

/// Flushes every `period` until `shutdown` resolves. A shutdown arriving
/// during a flush is acted on once that flush returns.
async fn flush_until<S>(
    shutdown: S,
    period: Duration,
    buffer: &BufferHandle,
    batcher: &ScribeBatcher<ThriftConnector>,
) where
    S: Future<Output = io::Result<()>>,
{
    tokio::pin!(shutdown);

    let mut flush_interval = interval(period);
    flush_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            biased;
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    error!("Failed to listen for the shutdown signal: {e}");
                }
                info!("Shutting down scribe relay");
                break;
            }
            _ = flush_interval.tick() => flush(buffer, batcher).await,
        }
    }
}

/// Drains the buffer and ships it; failed events go back for the next cycle.
async fn flush(buffer: &BufferHandle, batcher: &ScribeBatcher<ThriftConnector>) {
    let events = match buffer.drain().await {
        Ok(events) => events,
        Err(e) => {
            error!("Failed to drain event buffer: {e}");
            return;
        }
    };
    if events.is_empty() {
        return;
    }

    debug!("Flushing {} buffered events to scribe", events.len());
    if batcher.flush(&events).await.is_err() {
        let count = events.len();
        if let Err(e) = buffer.requeue(events) {
            error!("Failed to requeue {count} events, dropping them: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_bridge::scribe::{BufferedEvent, Record};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout, Instant};

    /// Accepts connections and never answers them.
    async fn silent_scribe() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });
        port
    }

    #[tokio::test]
    async fn test_shutdown_during_flush_stops_the_loop() {
        let port = silent_scribe().await;
        let config = ScribeOutputConfig {
            host: "127.0.0.1".to_string(),
            port,
            timeout: 1,
            ..Default::default()
        };
        let batcher = ScribeBatcher::new(&config, ThriftConnector::new(&config));

        let (service, buffer) = BufferService::new(10);
        tokio::spawn(service.run());
        let mut record = Record::new();
        record.insert("message".to_string(), "x".into());
        buffer
            .requeue(vec![BufferedEvent::new("a", 1, record)])
            .unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let shutdown = async move {
            let _ = shutdown_rx.await;
            Ok::<(), io::Error>(())
        };

        let started = Instant::now();
        let relay = flush_until(shutdown, Duration::from_millis(10), &buffer, &batcher);
        let signal = async {
            // the first flush is now waiting on the silent server
            sleep(Duration::from_millis(200)).await;
            shutdown_tx.send(()).unwrap();
        };
        timeout(Duration::from_secs(5), async { tokio::join!(relay, signal) })
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(900));
        // the timed out flush put its events back
        assert_eq!(buffer.len().await.unwrap(), 1);
    }
}
