// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use prometheus::{
    register_histogram_vec_with_registry, register_histogram_with_registry, Histogram,
    HistogramVec, Registry,
};
use strum_macros::{Display, EnumIter, IntoStaticStr};
use tokio::time::Instant;
use tracing::info;

use crate::error::BenchError;
use crate::store::{is_queue_full_message, StoreError, StoreResult};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10., 30., 60.,
];

const BACKOFF_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10.,
];

const SIZE_BYTE_BUCKETS: &[f64] = &[
    8., 32., 128., 512., 1024., 4096., 16384., 65536., 262144., 1048576.,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OpStatus {
    Success,
    Failed,
    FullQueue,
}

impl OpStatus {
    pub fn of_store_error(err: &StoreError) -> Self {
        if err.is_queue_full() {
            OpStatus::FullQueue
        } else {
            OpStatus::Failed
        }
    }

    /// Queue-full is recognised by message content, so a combined commit
    /// failure counts as queue-full when any of its parts was.
    pub fn of_error(err: &BenchError) -> Self {
        if is_queue_full_message(&err.to_string()) {
            OpStatus::FullQueue
        } else {
            OpStatus::Failed
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum OperationKind {
    Read,
    Write,
    Query,
    AsyncCommit,
    SyncCommit,
}

impl OperationKind {
    pub fn commit(sync: bool) -> Self {
        if sync {
            OperationKind::SyncCommit
        } else {
            OperationKind::AsyncCommit
        }
    }
}

/// Counters of a run, as seen at `taken_at`.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub success: u64,
    pub failed: u64,
    pub full_queue: u64,
    pub taken_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub success: u64,
    pub failed: u64,
    pub full_queue: u64,
    pub duration: Duration,
}

impl StatsSnapshot {
    pub fn since(&self, earlier: &StatsSnapshot) -> StatsWindow {
        StatsWindow {
            success: self.success.saturating_sub(earlier.success),
            failed: self.failed.saturating_sub(earlier.failed),
            full_queue: self.full_queue.saturating_sub(earlier.full_queue),
            duration: self.taken_at.saturating_duration_since(earlier.taken_at),
        }
    }
}

impl StatsWindow {
    pub fn success_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.success as f64 / secs
    }

    pub fn report(&self, title: &str) {
        info!(
            "[{:<10}] TX: [Success: {:>10} Fail: {:>10} FullQueue: {:>10}] - Duration: {:>5.1?} - Tx/sec: {:5.3}",
            title,
            self.success,
            self.failed,
            self.full_queue,
            self.duration,
            self.success_per_second()
        );
    }
}

/// Shared sink for every worker's measurements. Histograms and counters are
/// atomics, so workers record without any caller-side locking.
pub struct StatsCollector {
    operation_latency: HistogramVec,
    transaction_latency: HistogramVec,
    payload_size: HistogramVec,
    backoff_delay: Histogram,
    success: AtomicU64,
    failed: AtomicU64,
    full_queue: AtomicU64,
    recording: AtomicBool,
}

impl StatsCollector {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            operation_latency: register_histogram_vec_with_registry!(
                "client_operation_latency_seconds",
                "Latency of individual store operations",
                &["status", "operation"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            transaction_latency: register_histogram_vec_with_registry!(
                "client_transaction_latency_seconds",
                "Latency of a whole benchmark operation, from draw to commit",
                &["status"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            payload_size: register_histogram_vec_with_registry!(
                "client_payload_size_bytes",
                "Bytes written by a benchmark operation",
                &["status"],
                SIZE_BYTE_BUCKETS.to_vec(),
                registry,
            )?,
            backoff_delay: register_histogram_with_registry!(
                "client_backoff_delay_seconds",
                "Delay applied after a failed operation",
                BACKOFF_SEC_BUCKETS.to_vec(),
                registry,
            )?,
            success: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            full_queue: AtomicU64::new(0),
            recording: AtomicBool::new(true),
        })
    }

    /// Toggles prometheus recording. Off during warmup so that warmup
    /// traffic never shows up in the measured histograms.
    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Relaxed);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    /// Awaits `fut` and records its latency under `kind`.
    pub async fn time_operation<T, F>(&self, kind: OperationKind, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        if self.is_recording() {
            let status = match &result {
                Ok(_) => OpStatus::Success,
                Err(e) => OpStatus::of_store_error(e),
            };
            self.operation_latency
                .with_label_values(&[status.into(), kind.into()])
                .observe(start.elapsed().as_secs_f64());
        }
        result
    }

    /// Accounts one finished benchmark operation.
    pub fn record_outcome(&self, status: OpStatus, latency: Duration, payload_bytes: u64) {
        let counter = match status {
            OpStatus::Success => &self.success,
            OpStatus::Failed => &self.failed,
            OpStatus::FullQueue => &self.full_queue,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.is_recording() {
            let label: &str = status.into();
            self.transaction_latency
                .with_label_values(&[label])
                .observe(latency.as_secs_f64());
            if payload_bytes > 0 {
                self.payload_size
                    .with_label_values(&[label])
                    .observe(payload_bytes as f64);
            }
        }
    }

    pub fn observe_backoff(&self, delay: Duration) {
        if self.is_recording() {
            self.backoff_delay.observe(delay.as_secs_f64());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            full_queue: self.full_queue.load(Ordering::Relaxed),
            taken_at: Instant::now(),
        }
    }

    pub fn operation_latency(&self) -> &HistogramVec {
        &self.operation_latency
    }

    pub fn backoff_delay(&self) -> &Histogram {
        &self.backoff_delay
    }
}
