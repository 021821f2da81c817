// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{BenchError, BenchResult, ConfigError};
use crate::material::{user_name, BenchMaterial, UserMaterial};
use crate::stats::{OperationKind, StatsCollector};
use crate::store::{AccessControl, DataTx, KvSession, StoreError};
use crate::workloads::key_cycle::{CommitCursor, KeyCycle};
use crate::workloads::operation::OperationSpec;

const COUNTER_BYTES: u64 = 8;

/// Writes carry a little-endian counter, zero padded to the requested size.
pub fn encode_counter(counter: u64, size: u64) -> Vec<u8> {
    let mut value = counter.to_le_bytes().to_vec();
    value.resize(size.max(COUNTER_BYTES) as usize, 0);
    value
}

pub fn decode_counter(value: &[u8]) -> u64 {
    value
        .get(..COUNTER_BYTES as usize)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationOutcome {
    pub writes: u64,
    pub payload_bytes: u64,
}

/// Keys a transaction set will touch, derived from the key cycle before
/// anything is sent to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPlan {
    pub read_keys: Vec<String>,
    pub assert_keys: Vec<String>,
    pub write_keys: Vec<String>,
    pub sync: bool,
}

struct TxParams {
    tx: Box<dyn DataTx>,
    read_keys: Vec<String>,
    assert_keys: Vec<String>,
    write_keys: Vec<String>,
    acl: Option<AccessControl>,
    sync: bool,
    commit: bool,
    /// Counters seen by reads, keyed by key.
    priors: HashMap<String, u64>,
    /// Co-owners whose signature the commit needs.
    signers: BTreeSet<String>,
}

/// Turns one drawn [OperationSpec] into store calls for a single user.
pub struct TransactionOrchestrator {
    table: String,
    user: Arc<UserMaterial>,
    session: Arc<dyn KvSession>,
    material: Arc<BenchMaterial>,
    stats: Arc<StatsCollector>,
    with_acl: bool,
    read_writes_first: bool,
}

impl TransactionOrchestrator {
    pub fn new(
        table: impl Into<String>,
        user: Arc<UserMaterial>,
        session: Arc<dyn KvSession>,
        material: Arc<BenchMaterial>,
        stats: Arc<StatsCollector>,
    ) -> Self {
        Self {
            table: table.into(),
            user,
            session,
            material,
            stats,
            with_acl: false,
            read_writes_first: false,
        }
    }

    /// Every write carries an ACL owned by the acting user.
    pub fn with_acl(mut self, with_acl: bool) -> Self {
        self.with_acl = with_acl;
        self
    }

    /// Read written keys first so their ACL, and the co-signers it demands,
    /// is known before commit.
    pub fn read_writes_first(mut self, enabled: bool) -> Self {
        self.read_writes_first = enabled;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn key(&self, line: u64) -> String {
        format!("{}.{line:010}", self.user.name())
    }

    pub fn plan(&self, spec: &OperationSpec, keys: &KeyCycle, cursor: &CommitCursor) -> TxPlan {
        let lines = |n: u64| -> Vec<String> {
            keys.peek(n).into_iter().map(|l| self.key(l)).collect()
        };
        TxPlan {
            read_keys: lines(spec.reads),
            assert_keys: lines(spec.asserts),
            write_keys: lines(spec.writes),
            sync: spec.has_writes() && cursor.is_sync_due(),
        }
    }

    /// ACL attached to this operation's writes: the acting user plus the
    /// `spec.acl` users that follow it.
    pub fn access_control(&self, spec: &OperationSpec) -> BenchResult<Option<AccessControl>> {
        if spec.acl == 0 && !self.with_acl {
            return Ok(None);
        }
        let user_count = self.material.user_count();
        let index = self.user.index().ok_or_else(|| {
            BenchError::Config(ConfigError::Invalid(format!(
                "{} cannot own records",
                self.user.name()
            )))
        })?;
        if spec.acl >= user_count {
            return Err(BenchError::Config(ConfigError::InvalidOperation {
                operation: spec.to_string(),
                reason: format!("-acl {} needs more than {user_count} users", spec.acl),
            }));
        }
        let owners = std::iter::once(self.user.name().to_string())
            .chain((1..=spec.acl).map(|i| user_name((index + i) % user_count)));
        Ok(Some(AccessControl::owned_by(owners)))
    }

    pub async fn execute(
        &self,
        spec: &OperationSpec,
        keys: &KeyCycle,
        cursor: &CommitCursor,
    ) -> BenchResult<OperationOutcome> {
        if spec.is_query() {
            return self.query(spec.queries, keys).await;
        }

        let mut set = Vec::with_capacity(1 + spec.conflicts as usize);
        let result = self.transact(spec, keys, cursor, &mut set).await;
        self.abort_all(&mut set).await;
        result
    }

    async fn query(&self, width: u64, keys: &KeyCycle) -> BenchResult<OperationOutcome> {
        let start_key = self.key(keys.position());
        let drained = self
            .stats
            .time_operation(OperationKind::Query, async {
                let mut handle = self.session.query().await?;
                let mut cursor = handle.range(&self.table, &start_key, None, width).await?;
                // Results may be fetched lazily and must be consumed.
                let mut count = 0u64;
                while cursor.next().await?.is_some() {
                    count += 1;
                }
                Ok(count)
            })
            .await?;
        debug!("Query from {start_key} returned {drained} entries");
        Ok(OperationOutcome::default())
    }

    async fn open(
        &self,
        read_keys: Vec<String>,
        write_keys: Vec<String>,
        acl: Option<AccessControl>,
        sync: bool,
    ) -> BenchResult<TxParams> {
        let commit = !write_keys.is_empty();
        Ok(TxParams {
            tx: self.session.data_tx().await?,
            read_keys,
            assert_keys: vec![],
            write_keys,
            acl,
            sync,
            commit,
            priors: HashMap::new(),
            signers: BTreeSet::new(),
        })
    }

    async fn transact(
        &self,
        spec: &OperationSpec,
        keys: &KeyCycle,
        cursor: &CommitCursor,
        set: &mut Vec<TxParams>,
    ) -> BenchResult<OperationOutcome> {
        let plan = self.plan(spec, keys, cursor);
        let acl = self.access_control(spec)?;

        let mut primary_reads = plan.read_keys.clone();
        if self.read_writes_first {
            for key in &plan.write_keys {
                if !primary_reads.contains(key) {
                    primary_reads.push(key.clone());
                }
            }
        }
        let mut primary = self
            .open(primary_reads, plan.write_keys.clone(), acl, plan.sync)
            .await?;
        primary.assert_keys = plan.assert_keys.clone();
        set.push(primary);
        for _ in 0..spec.conflicts {
            // Reads what the primary is about to overwrite.
            let mut aux = self
                .open(plan.write_keys.clone(), vec![], None, plan.sync)
                .await?;
            aux.commit = true;
            set.push(aux);
        }

        for params in set.iter_mut() {
            self.read(params).await?;
        }
        for params in set.iter_mut() {
            for key in &params.assert_keys {
                self.stats
                    .time_operation(OperationKind::Read, params.tx.assert_read(&self.table, key))
                    .await?;
            }
        }
        let mut outcome = OperationOutcome::default();
        for params in set.iter_mut() {
            for key in &params.write_keys {
                let counter = params.priors.get(key).copied().unwrap_or(0) + 1;
                let value = encode_counter(counter, spec.size);
                outcome.writes += 1;
                outcome.payload_bytes += value.len() as u64;
                self.stats
                    .time_operation(
                        OperationKind::Write,
                        params.tx.put(&self.table, key, value, params.acl.clone()),
                    )
                    .await?;
            }
        }

        // Resolve every co-signer before anything commits.
        let mut cosigners = Vec::with_capacity(set.len());
        for params in set.iter() {
            let signers = params
                .signers
                .iter()
                .map(|name| {
                    self.material
                        .signer(name)
                        .cloned()
                        .ok_or_else(|| BenchError::MissingSigner(name.clone()))
                })
                .collect::<BenchResult<Vec<_>>>()?;
            cosigners.push(signers);
        }

        // The primary goes first. Conflict transactions commit after it on
        // reads it has since overwritten, so the store has to reject them.
        let mut errors = vec![];
        let mut committed = 0;
        for (params, signers) in set.iter_mut().zip(cosigners) {
            if !params.commit {
                continue;
            }
            committed += 1;
            if let Err(e) = self.commit(params, signers).await {
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(outcome),
            1 if committed == 1 => Err(errors.remove(0).into()),
            _ => Err(BenchError::CommitFailed(errors)),
        }
    }

    async fn read(&self, params: &mut TxParams) -> BenchResult<()> {
        for key in &params.read_keys {
            let stored = self
                .stats
                .time_operation(OperationKind::Read, params.tx.get(&self.table, key))
                .await?;
            let Some(stored) = stored else {
                continue;
            };
            params
                .priors
                .insert(key.clone(), decode_counter(&stored.value));
            if let Some(acl) = &stored.metadata.access_control {
                params.signers.extend(acl.co_signers(self.user.name()));
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        params: &mut TxParams,
        signers: Vec<Arc<UserMaterial>>,
    ) -> Result<(), StoreError> {
        if !signers.is_empty() {
            let mut envelope = params.tx.seal().await?;
            for signer in &signers {
                envelope
                    .signatures
                    .insert(signer.name().to_string(), signer.sign(&envelope.payload));
            }
            params.tx = self.session.load_data_tx(envelope).await?;
        }
        let sync = params.sync;
        let (tx_id, receipt) = self
            .stats
            .time_operation(OperationKind::commit(sync), params.tx.commit(sync))
            .await?;
        debug!("Committed txID: {tx_id}, receipt: {receipt:?}");
        Ok(())
    }

    async fn abort_all(&self, set: &mut [TxParams]) {
        for params in set.iter_mut() {
            match params.tx.abort().await {
                Ok(()) | Err(StoreError::TxSpent) => {}
                Err(e) => warn!("Failed to abort {}: {e}", params.tx.tx_id()),
            }
        }
    }
}
