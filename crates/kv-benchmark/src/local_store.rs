// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-process implementation of the store boundary.
//!
//! Tables are ordered maps of versioned values. Transactions are optimistic:
//! every read records the version it saw and commit fails with a conflict if
//! any of them moved. Writes to keys guarded by an access control list need
//! the signatures of its read-write users, collected by sealing the
//! transaction into an envelope and reloading it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::material::{verify_signature, UserMaterial, ADMIN_USER};
use crate::store::{
    AccessControl, Connector, DataTx, KvDatabase, KvSession, Metadata, QueryHandle, RangeCursor,
    SessionConfig, SignPolicy, StoreError, StoreResult, StoredValue, TxEnvelope, TxReceipt,
    UserRecord,
};

pub const QUEUE_FULL_MESSAGE: &str = "transaction queue is full";

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: u64,
    acl: Option<AccessControl>,
}

impl Entry {
    fn stored(&self) -> StoredValue {
        StoredValue {
            value: self.value.clone(),
            metadata: Metadata {
                version: self.version,
                access_control: self.acl.clone(),
            },
        }
    }

    fn readable_by(&self, user: &str) -> bool {
        match &self.acl {
            None => true,
            Some(acl) if acl.read_users.is_empty() && acl.read_write_users.is_empty() => true,
            Some(acl) => acl.read_users.contains(user) || acl.read_write_users.contains(user),
        }
    }
}

#[derive(Default)]
struct StoreState {
    tables: RwLock<BTreeMap<String, BTreeMap<String, Entry>>>,
    users: RwLock<HashMap<String, UserRecord>>,
    block_number: AtomicU64,
    next_tx: AtomicU64,
    pending: AtomicU64,
    queue_capacity: Mutex<Option<u64>>,
    injected_failures: Mutex<VecDeque<String>>,
    sync_commit_delay: Mutex<Duration>,
    connects: AtomicU64,
    sessions: AtomicU64,
}

impl StoreState {
    fn user(&self, id: &str) -> StoreResult<UserRecord> {
        self.users
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))
    }

    fn check_table_access(&self, user: &str, table: &str) -> StoreResult<()> {
        if !self.tables.read().contains_key(table) {
            return Err(StoreError::NotFound(format!("table {table}")));
        }
        if user == ADMIN_USER {
            return Ok(());
        }
        let record = self.user(user)?;
        if record.read_write_tables.iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied(format!(
                "{user} has no access to table {table}"
            )))
        }
    }

    fn read(&self, user: &str, table: &str, key: &str) -> StoreResult<Option<Entry>> {
        self.check_table_access(user, table)?;
        let tables = self.tables.read();
        let entry = tables.get(table).and_then(|t| t.get(key)).cloned();
        match entry {
            Some(entry) if !entry.readable_by(user) => Err(StoreError::PermissionDenied(
                format!("{user} cannot read {table}/{key}"),
            )),
            entry => Ok(entry),
        }
    }
}

/// A shared in-memory database. Cloning yields another handle to the same
/// data.
#[derive(Clone)]
pub struct LocalStore {
    state: Arc<StoreState>,
}

impl LocalStore {
    /// Creates an empty store whose only known identity is `admin`.
    pub fn new(admin: &UserMaterial) -> Self {
        let state = StoreState::default();
        state
            .users
            .write()
            .insert(admin.name().to_string(), admin.record(&[]));
        Self {
            state: Arc::new(state),
        }
    }

    /// Every following commit is rejected with `message` until `count`
    /// commits have failed.
    pub fn inject_commit_failures(&self, count: usize, message: &str) {
        let mut failures = self.state.injected_failures.lock();
        failures.extend(std::iter::repeat(message.to_string()).take(count));
    }

    /// Bounds the number of commits in flight. `Some(0)` rejects everything.
    pub fn set_queue_capacity(&self, capacity: Option<u64>) {
        *self.state.queue_capacity.lock() = capacity;
    }

    /// Simulated time to reach finality for synchronous commits.
    pub fn set_sync_commit_delay(&self, delay: Duration) {
        *self.state.sync_commit_delay.lock() = delay;
    }

    pub fn value(&self, table: &str, key: &str) -> Option<StoredValue> {
        self.state
            .tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .map(Entry::stored)
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.state.tables.read().get(table).map_or(0, |t| t.len())
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state.tables.read().contains_key(table)
    }

    pub fn is_registered(&self, user: &str) -> bool {
        self.state.users.read().contains_key(user)
    }

    pub fn block_number(&self) -> u64 {
        self.state.block_number.load(Ordering::Relaxed)
    }

    pub fn connect_count(&self) -> u64 {
        self.state.connects.load(Ordering::Relaxed)
    }

    pub fn session_count(&self) -> u64 {
        self.state.sessions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Connector for LocalStore {
    async fn connect(&self) -> StoreResult<Arc<dyn KvDatabase>> {
        self.state.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl KvDatabase for LocalStore {
    async fn session(
        &self,
        user: &UserMaterial,
        config: &SessionConfig,
    ) -> StoreResult<Arc<dyn KvSession>> {
        let record = self.state.user(user.name())?;
        if record.verification_key != user.verification_key().to_bytes() {
            return Err(StoreError::PermissionDenied(format!(
                "credential mismatch for {}",
                user.name()
            )));
        }
        self.state.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(LocalSession {
            state: self.state.clone(),
            user: Arc::new(user.clone()),
            config: config.clone(),
        }))
    }
}

struct LocalSession {
    state: Arc<StoreState>,
    user: Arc<UserMaterial>,
    config: SessionConfig,
}

impl LocalSession {
    fn require_admin(&self, action: &str) -> StoreResult<()> {
        if self.user.name() == ADMIN_USER {
            Ok(())
        } else {
            Err(StoreError::PermissionDenied(format!(
                "{} is not allowed to {action}",
                self.user.name()
            )))
        }
    }
}

#[async_trait]
impl KvSession for LocalSession {
    async fn data_tx(&self) -> StoreResult<Box<dyn DataTx>> {
        let id = format!("tx-{}", self.state.next_tx.fetch_add(1, Ordering::Relaxed));
        Ok(Box::new(LocalDataTx {
            payload: TxPayload {
                tx_id: id,
                user: self.user.name().to_string(),
                reads: BTreeMap::new(),
                writes: BTreeMap::new(),
            },
            signatures: BTreeMap::new(),
            spent: false,
            state: self.state.clone(),
            user: self.user.clone(),
            tx_timeout: self.config.tx_timeout,
        }))
    }

    async fn load_data_tx(&self, envelope: TxEnvelope) -> StoreResult<Box<dyn DataTx>> {
        let payload: TxPayload = bcs::from_bytes(&envelope.payload)
            .map_err(|e| StoreError::Rejected(format!("malformed envelope: {e}")))?;
        if !envelope.signatures.contains_key(&payload.user) {
            return Err(StoreError::PermissionDenied(format!(
                "envelope of {} is missing its creator's signature",
                payload.tx_id
            )));
        }
        for (signer, signature) in &envelope.signatures {
            let record = self.state.user(signer)?;
            if !verify_signature(&record.verification_key, &envelope.payload, signature) {
                return Err(StoreError::PermissionDenied(format!(
                    "invalid signature of {signer} on {}",
                    payload.tx_id
                )));
            }
        }
        Ok(Box::new(LocalDataTx {
            payload,
            signatures: envelope.signatures,
            spent: false,
            state: self.state.clone(),
            user: self.user.clone(),
            tx_timeout: self.config.tx_timeout,
        }))
    }

    async fn query(&self) -> StoreResult<Box<dyn QueryHandle>> {
        Ok(Box::new(LocalQuery {
            state: self.state.clone(),
            user: self.user.name().to_string(),
            timeout: self.config.query_timeout,
        }))
    }

    async fn create_table(&self, table: &str) -> StoreResult<()> {
        self.require_admin("create tables")?;
        self.state
            .tables
            .write()
            .entry(table.to_string())
            .or_default();
        debug!("Created table {table}");
        Ok(())
    }

    async fn register_users(&self, users: Vec<UserRecord>) -> StoreResult<()> {
        self.require_admin("register users")?;
        let mut registry = self.state.users.write();
        for user in users {
            if user.id == ADMIN_USER {
                return Err(StoreError::Rejected("cannot overwrite the admin".into()));
            }
            registry.insert(user.id.clone(), user);
        }
        Ok(())
    }
}

type TableKey = (String, String);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TxPayload {
    tx_id: String,
    user: String,
    /// Versions observed by reads; `None` if the key did not exist.
    reads: BTreeMap<TableKey, Option<u64>>,
    writes: BTreeMap<TableKey, (Vec<u8>, Option<AccessControl>)>,
}

struct LocalDataTx {
    payload: TxPayload,
    signatures: BTreeMap<String, Vec<u8>>,
    spent: bool,
    state: Arc<StoreState>,
    user: Arc<UserMaterial>,
    tx_timeout: Duration,
}

impl LocalDataTx {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.spent {
            Err(StoreError::TxSpent)
        } else {
            Ok(())
        }
    }

    fn record_read(&mut self, table: &str, key: &str) -> StoreResult<Option<Entry>> {
        self.ensure_open()?;
        let entry = self.state.read(&self.payload.user, table, key)?;
        self.payload
            .reads
            .entry((table.to_string(), key.to_string()))
            .or_insert(entry.as_ref().map(|e| e.version));
        Ok(entry)
    }

    fn signed_by(&self, user: &str) -> bool {
        user == self.payload.user || self.signatures.contains_key(user)
    }

    fn check_write_permission(&self, key: &TableKey, current: Option<&Entry>) -> StoreResult<()> {
        let Some(acl) = current.and_then(|e| e.acl.as_ref()) else {
            return Ok(());
        };
        if acl.read_write_users.is_empty() {
            return Ok(());
        }
        let allowed = match acl.sign_policy_for_write {
            SignPolicy::All => acl.read_write_users.iter().all(|u| self.signed_by(u)),
            SignPolicy::Any => acl.read_write_users.iter().any(|u| self.signed_by(u)),
        };
        if allowed {
            Ok(())
        } else {
            let missing: BTreeSet<&String> = acl
                .read_write_users
                .iter()
                .filter(|u| !self.signed_by(u))
                .collect();
            Err(StoreError::PermissionDenied(format!(
                "write to {}/{} lacks signatures of {missing:?}",
                key.0, key.1
            )))
        }
    }

    /// Validates and applies the transaction atomically.
    fn apply(&self) -> StoreResult<TxReceipt> {
        if let Some(message) = self.state.injected_failures.lock().pop_front() {
            return Err(StoreError::Rejected(message));
        }

        let mut tables = self.state.tables.write();
        for ((table, key), seen) in &self.payload.reads {
            let current = tables
                .get(table)
                .and_then(|t| t.get(key))
                .map(|e| e.version);
            if current != *seen {
                return Err(StoreError::Conflict {
                    table: table.clone(),
                    key: key.clone(),
                });
            }
        }
        for (table_key, _) in self.payload.writes.iter() {
            let (table, key) = table_key;
            let current = tables
                .get(table)
                .ok_or_else(|| StoreError::NotFound(format!("table {table}")))?
                .get(key);
            self.check_write_permission(table_key, current)?;
        }

        let block_number = self.state.block_number.fetch_add(1, Ordering::Relaxed) + 1;
        for ((table, key), (value, acl)) in &self.payload.writes {
            let Some(rows) = tables.get_mut(table) else {
                continue;
            };
            let previous_acl = rows.get(key).and_then(|e| e.acl.clone());
            rows.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    version: block_number,
                    acl: acl.clone().or(previous_acl),
                },
            );
        }
        Ok(TxReceipt {
            block_number,
            tx_index: 0,
        })
    }
}

#[async_trait]
impl DataTx for LocalDataTx {
    fn tx_id(&self) -> &str {
        &self.payload.tx_id
    }

    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<StoredValue>> {
        Ok(self.record_read(table, key)?.map(|e| e.stored()))
    }

    async fn assert_read(&mut self, table: &str, key: &str) -> StoreResult<Option<u64>> {
        Ok(self.record_read(table, key)?.map(|e| e.version))
    }

    async fn put(
        &mut self,
        table: &str,
        key: &str,
        value: Vec<u8>,
        acl: Option<AccessControl>,
    ) -> StoreResult<()> {
        self.ensure_open()?;
        self.state.check_table_access(&self.payload.user, table)?;
        self.payload
            .writes
            .insert((table.to_string(), key.to_string()), (value, acl));
        Ok(())
    }

    async fn seal(&mut self) -> StoreResult<TxEnvelope> {
        self.ensure_open()?;
        self.spent = true;
        let payload = bcs::to_bytes(&self.payload)
            .map_err(|e| StoreError::Rejected(format!("cannot encode transaction: {e}")))?;
        let mut signatures = BTreeMap::new();
        signatures.insert(self.payload.user.clone(), self.user.sign(&payload));
        Ok(TxEnvelope {
            payload,
            signatures,
        })
    }

    async fn commit(&mut self, sync: bool) -> StoreResult<(String, TxReceipt)> {
        self.ensure_open()?;
        self.spent = true;

        let capacity = *self.state.queue_capacity.lock();
        let in_flight = self.state.pending.fetch_add(1, Ordering::AcqRel) + 1;
        let result = match capacity {
            Some(capacity) if in_flight > capacity => {
                Err(StoreError::Rejected(QUEUE_FULL_MESSAGE.to_string()))
            }
            _ => self.apply(),
        };

        let delay = *self.state.sync_commit_delay.lock();
        let result = match result {
            Ok(receipt) if sync && !delay.is_zero() => {
                tokio::time::timeout(self.tx_timeout, tokio::time::sleep(delay))
                    .await
                    .map(|_| receipt)
                    .map_err(|_| {
                        StoreError::Rejected(format!(
                            "timed out waiting for finality of {}",
                            self.payload.tx_id
                        ))
                    })
            }
            other => other,
        };
        self.state.pending.fetch_sub(1, Ordering::AcqRel);

        let receipt = result?;
        trace!("{} committed in block {}", self.payload.tx_id, receipt.block_number);
        Ok((self.payload.tx_id.clone(), receipt))
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.spent = true;
        Ok(())
    }
}

struct LocalQuery {
    state: Arc<StoreState>,
    user: String,
    timeout: Duration,
}

#[async_trait]
impl QueryHandle for LocalQuery {
    async fn range(
        &mut self,
        table: &str,
        start_key: &str,
        end_key: Option<&str>,
        limit: u64,
    ) -> StoreResult<Box<dyn RangeCursor>> {
        self.state.check_table_access(&self.user, table)?;
        let tables = self.state.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| StoreError::NotFound(format!("table {table}")))?;
        let limit = if limit == 0 { usize::MAX } else { limit as usize };
        let entries = rows
            .range(start_key.to_string()..)
            .take_while(|(k, _)| end_key.map_or(true, |end| k.as_str() < end))
            .filter(|(_, e)| e.readable_by(&self.user))
            .take(limit)
            .map(|(k, e)| (k.clone(), e.stored()))
            .collect();
        Ok(Box::new(LocalCursor {
            entries,
            timeout: self.timeout,
            deadline: Instant::now() + self.timeout,
        }))
    }
}

/// Iterates a range snapshot. The whole scan must finish within the
/// session's query timeout.
struct LocalCursor {
    entries: VecDeque<(String, StoredValue)>,
    timeout: Duration,
    deadline: Instant,
}

#[async_trait]
impl RangeCursor for LocalCursor {
    async fn next(&mut self) -> StoreResult<Option<(String, StoredValue)>> {
        if Instant::now() >= self.deadline {
            self.entries.clear();
            return Err(StoreError::Rejected(format!(
                "query timed out after {:?}",
                self.timeout
            )));
        }
        Ok(self.entries.pop_front())
    }
}
