// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use prometheus::Registry;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{BenchmarkConfig, WorkloadConfig};
use crate::error::{BenchError, BenchResult, ConfigError};
use crate::material::BenchMaterial;
use crate::metrics::MetricsService;
use crate::session_cache::SessionCache;
use crate::stats::StatsCollector;
use crate::store::Connector;
use crate::workloads::{Phase, Workload, WorkloadContext, WorkloadKind};

/// Totals of one phase, counted from the moment the workers were released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub phase: Phase,
    pub users: usize,
    pub duration: Duration,
    pub success: u64,
    pub failed: u64,
    pub full_queue: u64,
    /// Some workers were still busy when the grace period ran out.
    pub timed_out: bool,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} with {} users: {} succeeded, {} failed, {} rejected by a full queue in {:.1?}",
            self.phase, self.users, self.success, self.failed, self.full_queue, self.duration
        )
    }
}

/// Drives every user assigned to one load-generating process through the
/// init, warmup and benchmark phases.
pub struct WorkloadCoordinator {
    config: Arc<WorkloadConfig>,
    rank: u64,
    workload: Arc<dyn Workload>,
    ctx: WorkloadContext,
    registry: Registry,
    metrics: OnceCell<Option<SocketAddr>>,
    cancel: CancellationToken,
}

impl WorkloadCoordinator {
    /// Validates the configuration and the workload parameters. Nothing
    /// touches the store yet.
    pub fn new(
        config: &BenchmarkConfig,
        rank: u64,
        material: Arc<BenchMaterial>,
        connector: Arc<dyn Connector>,
    ) -> BenchResult<Self> {
        let workload_config = Arc::new(config.workload.clone());
        workload_config.validate()?;
        if rank >= workload_config.worker_count() {
            return Err(ConfigError::Invalid(format!(
                "worker rank {rank} is outside of the {} configured workers",
                workload_config.worker_count()
            ))
            .into());
        }
        if material.user_count() < workload_config.user_count {
            return Err(ConfigError::Invalid(format!(
                "key material covers {} users, {} are configured",
                material.user_count(),
                workload_config.user_count
            ))
            .into());
        }

        let workload = WorkloadKind::from_name(&workload_config.name)?.build(&workload_config)?;
        let registry = Registry::new();
        let stats = Arc::new(StatsCollector::new(&registry)?);
        let sessions = Arc::new(SessionCache::new(
            connector,
            workload_config.session.session_config(),
        ));

        Ok(Self {
            ctx: WorkloadContext {
                config: workload_config.clone(),
                material,
                sessions,
                stats,
            },
            config: workload_config,
            rank,
            workload,
            registry,
            metrics: OnceCell::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.ctx.stats
    }

    pub fn context(&self) -> &WorkloadContext {
        &self.ctx
    }

    pub async fn init(&self) -> BenchResult<()> {
        info!("Initializing workload {}", self.config.name);
        self.workload.init(&self.ctx).await
    }

    pub async fn run_warmup(&self) -> BenchResult<RunReport> {
        self.run_all_users(Phase::Warmup, self.config.warmup_duration)
            .await
    }

    pub async fn run_benchmark(&self) -> BenchResult<RunReport> {
        self.run_all_users(Phase::Benchmark, self.config.duration)
            .await
    }

    /// Starts the metrics endpoint if one is configured. Later calls return
    /// the address bound by the first one.
    pub async fn start_metrics(&self) -> BenchResult<Option<SocketAddr>> {
        self.metrics
            .get_or_try_init(|| async {
                let Some(addr) = self.config.metrics_address else {
                    return Ok::<_, BenchError>(None);
                };
                let service =
                    MetricsService::new(addr, self.registry.clone(), self.cancel.child_token());
                let (bound, _handle) = service.run().await?;
                Ok(Some(bound))
            })
            .await
            .copied()
    }

    /// Runs every user of this rank for `duration`.
    ///
    /// All workers are built first and report back over a channel. They are
    /// released together once every one of them is ready, and the deadline
    /// is fixed at that instant. A fatal worker error pulls the deadline in
    /// for everybody and is returned once the workers are done.
    pub async fn run_all_users(&self, phase: Phase, duration: Duration) -> BenchResult<RunReport> {
        self.start_metrics().await?;
        let users = self.config.worker_users(self.rank);
        self.ctx.stats.set_recording(phase == Phase::Benchmark);
        if duration.is_zero() {
            info!("Skipping {phase}, its duration is zero");
            return Ok(RunReport {
                phase,
                users: users.len(),
                duration,
                success: 0,
                failed: 0,
                full_queue: 0,
                timed_out: false,
            });
        }

        let (start_tx, start_rx) = watch::channel(None);
        let (init_tx, mut init_rx) = mpsc::channel::<BenchResult<()>>(users.len().max(1));
        let mut tasks = FuturesUnordered::new();

        info!(
            "Initiating {phase} workers for {} users on rank {}",
            users.len(),
            self.rank
        );
        for index in &users {
            let user = self.ctx.material.user(*index).cloned().ok_or_else(|| {
                ConfigError::Invalid(format!("no key material for user {index}"))
            })?;
            let name = user.name().to_string();
            let workload = self.workload.clone();
            let ctx = self.ctx.clone();
            let init_tx = init_tx.clone();
            let start_rx = start_rx.clone();
            let handle = tokio::spawn(async move {
                let worker = match workload.make_worker(&ctx, user).await {
                    Ok(worker) => worker,
                    Err(e) => {
                        let _ = init_tx.send(Err(e)).await;
                        return Ok(());
                    }
                };
                let _ = init_tx.send(Ok(())).await;
                drop(init_tx);
                worker.run(phase, start_rx).await
            });
            tasks.push(async move { (name, handle.await) });
        }
        drop(init_tx);
        drop(start_rx);

        let mut init_error = None;
        while let Some(report) = init_rx.recv().await {
            if let Err(e) = report {
                error!("Worker initialization failed: {e}");
                init_error.get_or_insert(e);
            }
        }
        if let Some(e) = init_error {
            // Release the workers that did come up with a deadline in the
            // past so they exit right away.
            start_tx.send_replace(Some(Instant::now()));
            while tasks.next().await.is_some() {}
            return Err(e);
        }
        info!("Workers finished initialization");

        let baseline = self.ctx.stats.snapshot();
        let started = baseline.taken_at;
        start_tx.send_replace(Some(started + duration));
        info!("Work started");

        let interval = self.config.report_interval;
        let mut ticker = time::interval_at(started + interval, interval);
        let hard_stop = time::sleep_until(started + duration + self.config.grace_period);
        tokio::pin!(hard_stop);

        let mut last = baseline;
        let mut fatal: Option<BenchError> = None;
        let mut timed_out = false;
        loop {
            tokio::select! {
                joined = tasks.next() => {
                    let Some((user, joined)) = joined else {
                        break;
                    };
                    let failure = match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e),
                        Err(e) => Some(BenchError::WorkerAborted {
                            user,
                            message: e.to_string(),
                        }),
                    };
                    if let Some(e) = failure {
                        error!("Worker failed: {e}");
                        if fatal.is_none() {
                            start_tx.send_replace(Some(Instant::now()));
                            fatal = Some(e);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = self.ctx.stats.snapshot();
                    now.since(&last).report("Window");
                    now.since(&baseline).report("Total");
                    last = now;
                }
                _ = &mut hard_stop => {
                    warn!(
                        "{} workers still running {:?} after the deadline, not waiting for them",
                        tasks.len(),
                        self.config.grace_period
                    );
                    timed_out = true;
                    break;
                }
            }
        }

        let total = self.ctx.stats.snapshot().since(&baseline);
        total.report("Total");
        info!("Work ended");
        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(RunReport {
            phase,
            users: users.len(),
            duration: total.duration,
            success: total.success,
            failed: total.failed,
            full_queue: total.full_queue,
            timed_out,
        })
    }

    /// Stops the metrics endpoint.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkloadCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
