// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::WorkloadConfig;
use crate::drivers::user_worker::UserWorker;
use crate::error::{BenchResult, ConfigError};
use crate::material::UserMaterial;
use crate::workloads::key_cycle::{CommitCursor, KeyCycle};
use crate::workloads::operation::{OperationSelector, OperationSpec};
use crate::workloads::transaction::TransactionOrchestrator;
use crate::workloads::{Workload, WorkloadContext};

pub const TABLE: &str = "counters";

/// Each user increments a single counter it alone owns, committing
/// synchronously every time.
#[derive(Debug, Default)]
pub struct UpdatesWorkload;

impl UpdatesWorkload {
    pub fn new(_config: &WorkloadConfig) -> Result<Self, ConfigError> {
        Ok(Self)
    }
}

#[async_trait]
impl Workload for UpdatesWorkload {
    fn table(&self) -> &str {
        TABLE
    }

    async fn make_worker(
        &self,
        ctx: &WorkloadContext,
        user: Arc<UserMaterial>,
    ) -> BenchResult<UserWorker> {
        let session = ctx.sessions.session(&user).await?;
        let orchestrator = TransactionOrchestrator::new(
            TABLE,
            user.clone(),
            session,
            ctx.material.clone(),
            ctx.stats.clone(),
        )
        .with_acl(true);
        let increment = OperationSpec {
            reads: 1,
            writes: 1,
            ..Default::default()
        };

        // One key, and a cursor of size one is always due for a sync.
        Ok(UserWorker::new(
            user,
            orchestrator,
            OperationSelector::fixed(increment)?,
            &ctx.config.session.backoff,
            ctx.stats.clone(),
        )
        .with_keys(KeyCycle::new(1))
        .with_commit_cursor(CommitCursor::new(1, 0))
        .with_warmup(increment))
    }
}
