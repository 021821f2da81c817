// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::WorkloadConfig;
use crate::drivers::user_worker::UserWorker;
use crate::error::{BenchError, BenchResult, ConfigError};
use crate::material::UserMaterial;
use crate::workloads::key_cycle::{CommitCursor, KeyCycle};
use crate::workloads::operation::{OperationSelector, OperationSpec};
use crate::workloads::transaction::TransactionOrchestrator;
use crate::workloads::{Workload, WorkloadContext, COMMITS_PER_SYNC, LINES_PER_USER};

pub const TABLE: &str = "blind_writes";

/// Single-key writes that never read, cycling over `lines-per-user` keys.
#[derive(Debug)]
pub struct BlindWritesWorkload {
    lines_per_user: u64,
    commits_per_sync: u64,
}

impl BlindWritesWorkload {
    pub fn new(config: &WorkloadConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            lines_per_user: config.parameters.get_u64(LINES_PER_USER)?,
            commits_per_sync: config.parameters.get_u64(COMMITS_PER_SYNC)?,
        })
    }
}

#[async_trait]
impl Workload for BlindWritesWorkload {
    fn table(&self) -> &str {
        TABLE
    }

    async fn make_worker(
        &self,
        ctx: &WorkloadContext,
        user: Arc<UserMaterial>,
    ) -> BenchResult<UserWorker> {
        let index = user
            .index()
            .ok_or_else(|| BenchError::Config(ConfigError::Invalid("admin cannot work".into())))?;
        let session = ctx.sessions.session(&user).await?;
        let orchestrator = TransactionOrchestrator::new(
            TABLE,
            user.clone(),
            session,
            ctx.material.clone(),
            ctx.stats.clone(),
        );
        let write = OperationSpec::write_only(1);

        Ok(UserWorker::new(
            user,
            orchestrator,
            OperationSelector::fixed(write)?,
            &ctx.config.session.backoff,
            ctx.stats.clone(),
        )
        .with_keys(KeyCycle::new(self.lines_per_user))
        .with_commit_cursor(CommitCursor::for_user(
            index,
            ctx.config.user_count,
            self.commits_per_sync,
        ))
        .with_warmup(write))
    }
}
