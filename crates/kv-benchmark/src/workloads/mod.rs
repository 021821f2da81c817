// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};
use tracing::info;

use crate::config::WorkloadConfig;
use crate::drivers::user_worker::UserWorker;
use crate::error::{BenchResult, ConfigError};
use crate::material::{BenchMaterial, UserMaterial};
use crate::session_cache::SessionCache;
use crate::stats::StatsCollector;

pub mod blind_writes;
pub mod independent;
pub mod key_cycle;
pub mod operation;
pub mod transaction;
pub mod updates;

pub use blind_writes::BlindWritesWorkload;
pub use independent::IndependentWorkload;
pub use updates::UpdatesWorkload;

pub const LINES_PER_USER: &str = "lines-per-user";
pub const COMMITS_PER_SYNC: &str = "commits-per-sync";
pub const WITH_ACL: &str = "with-acl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Warmup,
    Benchmark,
}

/// Everything a workload needs to set up the store and build its workers.
/// Shared by all workers of a process.
#[derive(Clone)]
pub struct WorkloadContext {
    pub config: Arc<WorkloadConfig>,
    pub material: Arc<BenchMaterial>,
    pub sessions: Arc<SessionCache>,
    pub stats: Arc<StatsCollector>,
}

#[async_trait]
pub trait Workload: Send + Sync {
    fn table(&self) -> &str;

    /// One-shot setup: creates the table and registers every user with
    /// read-write access to it.
    async fn init(&self, ctx: &WorkloadContext) -> BenchResult<()> {
        let table = self.table();
        let admin = ctx.sessions.session(ctx.material.admin()).await?;
        admin.create_table(table).await?;
        let records = ctx
            .material
            .all_users()
            .iter()
            .map(|u| u.record(&[table]))
            .collect::<Vec<_>>();
        let count = records.len();
        admin.register_users(records).await?;
        info!("Created table {table} and registered {count} users");
        Ok(())
    }

    async fn make_worker(
        &self,
        ctx: &WorkloadContext,
        user: Arc<UserMaterial>,
    ) -> BenchResult<UserWorker>;
}

/// Registry of the available workloads, keyed by their configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WorkloadKind {
    Independent,
    IndependentBlindWrites,
    IndependentUpdates,
}

impl WorkloadKind {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        Self::from_str(name).map_err(|_| ConfigError::UnknownWorkload {
            name: name.to_string(),
            known: Self::iter()
                .map(|kind| kind.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Reads and validates the workload's parameters. Any problem surfaces
    /// here, before a single worker is created.
    pub fn build(self, config: &WorkloadConfig) -> Result<Arc<dyn Workload>, ConfigError> {
        Ok(match self {
            WorkloadKind::Independent => Arc::new(IndependentWorkload::new(config)?),
            WorkloadKind::IndependentBlindWrites => Arc::new(BlindWritesWorkload::new(config)?),
            WorkloadKind::IndependentUpdates => Arc::new(UpdatesWorkload::new(config)?),
        })
    }
}
