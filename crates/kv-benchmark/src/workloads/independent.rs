// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DistributionEntry, WorkloadConfig};
use crate::drivers::user_worker::UserWorker;
use crate::error::{BenchError, BenchResult, ConfigError};
use crate::material::UserMaterial;
use crate::workloads::key_cycle::{CommitCursor, KeyCycle};
use crate::workloads::operation::{OperationSelector, OperationSpec};
use crate::workloads::transaction::TransactionOrchestrator;
use crate::workloads::{Workload, WorkloadContext, COMMITS_PER_SYNC, LINES_PER_USER, WITH_ACL};

pub const TABLE: &str = "benchmark_db";

/// Every user works on its own `lines-per-user` keys with the configured
/// operation mix. Warmup writes each line once.
#[derive(Debug)]
pub struct IndependentWorkload {
    distributions: Vec<DistributionEntry>,
    lines_per_user: u64,
    commits_per_sync: u64,
    with_acl: bool,
    /// Some operation attaches co-owners, so written keys may need
    /// co-signers and have to be read before they are overwritten.
    read_writes_first: bool,
}

impl IndependentWorkload {
    pub fn new(config: &WorkloadConfig) -> Result<Self, ConfigError> {
        let params = &config.parameters;
        let lines_per_user = params.get_u64(LINES_PER_USER)?;
        let commits_per_sync = params.get_u64(COMMITS_PER_SYNC)?;
        let with_acl = params.get_bool(WITH_ACL)?;

        let selector = OperationSelector::new(&config.distributions)?;
        let widest = selector
            .operations()
            .iter()
            .max_by_key(|op| op.acl)
            .copied()
            .unwrap_or_default();
        if widest.acl >= config.user_count {
            return Err(ConfigError::InvalidOperation {
                operation: widest.to_string(),
                reason: format!(
                    "-acl {} needs more than {} users",
                    widest.acl, config.user_count
                ),
            });
        }

        Ok(Self {
            distributions: config.distributions.clone(),
            lines_per_user,
            commits_per_sync,
            with_acl,
            read_writes_first: with_acl || widest.acl > 0,
        })
    }
}

#[async_trait]
impl Workload for IndependentWorkload {
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
        )
        .with_acl(self.with_acl)
        .read_writes_first(self.read_writes_first);
        let selector = OperationSelector::new(&self.distributions)?;

        Ok(UserWorker::new(
            user,
            orchestrator,
            selector,
            &ctx.config.session.backoff,
            ctx.stats.clone(),
        )
        .with_keys(KeyCycle::new(self.lines_per_user))
        .with_commit_cursor(CommitCursor::for_user(
            index,
            ctx.config.user_count,
            self.commits_per_sync,
        ))
        .with_warmup(OperationSpec::write_only(1)))
    }
}
