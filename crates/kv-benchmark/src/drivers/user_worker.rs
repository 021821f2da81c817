// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task;
use tokio::time::{self, Instant};
use tracing::{debug, error, info};

use crate::config::BackoffConfig;
use crate::drivers::backoff::BackoffPolicy;
use crate::error::{BenchError, BenchResult};
use crate::material::UserMaterial;
use crate::stats::{OpStatus, StatsCollector};
use crate::workloads::key_cycle::{CommitCursor, KeyCycle};
use crate::workloads::operation::{OperationSelector, OperationSpec};
use crate::workloads::transaction::TransactionOrchestrator;
use crate::workloads::Phase;

/// Shared start signal: `None` until the coordinator releases the workers,
/// then the deadline of the run. The coordinator may pull the deadline in to
/// stop everyone early.
pub type StartSignal = watch::Receiver<Option<Instant>>;

/// One simulated user. All of its state is owned by the worker task.
pub struct UserWorker {
    user: Arc<UserMaterial>,
    orchestrator: TransactionOrchestrator,
    selector: OperationSelector,
    warmup: Option<OperationSpec>,
    keys: KeyCycle,
    cursor: CommitCursor,
    backoff: BackoffPolicy,
    stats: Arc<StatsCollector>,
}

impl UserWorker {
    pub fn new(
        user: Arc<UserMaterial>,
        orchestrator: TransactionOrchestrator,
        selector: OperationSelector,
        backoff: &BackoffConfig,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            user,
            orchestrator,
            selector,
            warmup: None,
            keys: KeyCycle::new(0),
            cursor: CommitCursor::new(0, 0),
            backoff: BackoffPolicy::new(backoff, stats.clone()),
            stats,
        }
    }

    pub fn with_keys(mut self, keys: KeyCycle) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_commit_cursor(mut self, cursor: CommitCursor) -> Self {
        self.cursor = cursor;
        self
    }

    /// Operation used during warmup instead of drawing from the selector.
    pub fn with_warmup(mut self, spec: OperationSpec) -> Self {
        self.warmup = Some(spec);
        self
    }

    pub fn name(&self) -> &str {
        self.user.name()
    }

    pub fn keys(&self) -> &KeyCycle {
        &self.keys
    }

    pub fn commit_cursor(&self) -> &CommitCursor {
        &self.cursor
    }

    pub fn orchestrator(&self) -> &TransactionOrchestrator {
        &self.orchestrator
    }

    /// Waits for the start signal, then operates until the deadline passes.
    pub async fn run(mut self, phase: Phase, mut start: StartSignal) -> BenchResult<()> {
        let released = start.wait_for(Option::is_some).await.is_ok();
        if !released {
            debug!("{}: coordinator went away before the start", self.name());
            return Ok(());
        }

        let mut operations = 0u64;
        loop {
            // Re-read every iteration, the deadline may have been pulled in.
            let Some(deadline) = *start.borrow() else {
                break;
            };
            if Instant::now() >= deadline {
                break;
            }
            // The store may answer without ever suspending; let the other
            // users of this runtime thread run.
            task::yield_now().await;
            if let Some(delay) = self.step(phase).await? {
                time::sleep_until((Instant::now() + delay).min(deadline)).await;
            }
            operations += 1;
        }
        debug!("{} finished {phase} after {operations} attempts", self.name());
        Ok(())
    }

    /// Runs one operation. On failure returns the backoff delay to wait
    /// before the next attempt. Cursors only move on success.
    pub async fn step(&mut self, phase: Phase) -> BenchResult<Option<Duration>> {
        let spec = match (phase, self.warmup) {
            (Phase::Warmup, Some(spec)) => spec,
            _ => self.selector.draw(),
        };

        let start = Instant::now();
        let result = self
            .orchestrator
            .execute(&spec, &self.keys, &self.cursor)
            .await;
        let latency = start.elapsed();

        match result {
            Ok(outcome) => {
                self.stats
                    .record_outcome(OpStatus::Success, latency, outcome.payload_bytes);
                self.keys.advance(spec.key_advance());
                if spec.has_writes() {
                    self.cursor.advance();
                }
                self.backoff.reset();
                Ok(None)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let status = OpStatus::of_error(&e);
                match status {
                    OpStatus::FullQueue => debug!("{}: {e}", self.name()),
                    _ => error!("Tx failed for {} ({spec}): {e}", self.name()),
                }
                self.stats.record_outcome(status, latency, 0);
                match self.backoff.next() {
                    Some(delay) => Ok(Some(delay)),
                    None => {
                        info!(
                            "{}: giving up after {} consecutive failures",
                            self.name(),
                            self.backoff.failures()
                        );
                        Err(BenchError::BackoffExhausted {
                            user: self.name().to_string(),
                            elapsed: self.backoff.elapsed(),
                        })
                    }
                }
            }
        }
    }
}
