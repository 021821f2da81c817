// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Extension, Router};
use prometheus::{Registry, TextEncoder};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Serves the prometheus registry as text on a "/metrics" route until the
/// cancellation token fires.
pub struct MetricsService {
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
}

impl MetricsService {
    pub fn new(addr: SocketAddr, registry: Registry, cancel: CancellationToken) -> Self {
        Self {
            addr,
            registry,
            cancel,
        }
    }

    /// Binds the listener and starts serving in the background. Returns the
    /// bound address, which differs from the requested one for port 0.
    pub async fn run(self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let Self {
            addr,
            registry,
            cancel,
        } = self;

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = Router::new()
            .route("/metrics", get(metrics))
            .layer(Extension(registry));

        let handle = tokio::spawn(async move {
            info!("Starting metrics service on {}", local_addr);
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                    info!("Shutdown received, shutting down metrics service");
                })
                .await;
            if let Err(e) = served {
                error!("Metrics service failed: {e}");
            }
        });
        Ok((local_addr, handle))
    }
}

async fn metrics(Extension(registry): Extension<Registry>) -> (StatusCode, String) {
    match TextEncoder.encode_to_string(&registry.gather()) {
        Ok(s) => (StatusCode::OK, s),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{OpStatus, StatsCollector};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn serves_registered_metrics() {
        let registry = Registry::new();
        let stats = StatsCollector::new(&registry).unwrap();
        stats.record_outcome(OpStatus::FullQueue, Duration::from_millis(2), 0);

        let cancel = CancellationToken::new();
        let (addr, handle) = MetricsService::new(
            "127.0.0.1:0".parse().unwrap(),
            registry,
            cancel.clone(),
        )
        .run()
        .await
        .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("client_transaction_latency_seconds_count{status=\"full_queue\"} 1"));

        cancel.cancel();
        handle.await.unwrap();
    }
}
