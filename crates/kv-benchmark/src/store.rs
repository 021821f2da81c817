// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The boundary between the benchmark engine and the database under test.
//!
//! The engine only ever talks to the store through the traits in this module.
//! A real deployment plugs its database client in behind [Connector]; the
//! crate ships [crate::local_store::LocalStore] as an in-process reference.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::material::UserMaterial;

// Constant pattern, cannot fail to compile.
static FULL_QUEUE_EXP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)queue is full").unwrap());

/// True if `message` reports that the store refused a transaction because its
/// pending queue is full.
pub fn is_queue_full_message(message: &str) -> bool {
    FULL_QUEUE_EXP.is_match(message)
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transaction already spent")]
    TxSpent,

    #[error("mvcc conflict on {table}/{key}")]
    Conflict { table: String, key: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_queue_full(&self) -> bool {
        is_queue_full_message(&self.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignPolicy {
    /// Any one of the read-write users may sign a write.
    Any,
    /// Every read-write user has to sign a write.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    pub read_users: BTreeSet<String>,
    pub read_write_users: BTreeSet<String>,
    pub sign_policy_for_write: SignPolicy,
}

impl AccessControl {
    pub fn owned_by<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            read_users: BTreeSet::new(),
            read_write_users: users.into_iter().map(Into::into).collect(),
            sign_policy_for_write: SignPolicy::All,
        }
    }

    /// Read-write users, other than `acting_user`, whose signature a write
    /// guarded by this ACL needs.
    pub fn co_signers(&self, acting_user: &str) -> BTreeSet<String> {
        match self.sign_policy_for_write {
            SignPolicy::All => self
                .read_write_users
                .iter()
                .filter(|u| u.as_str() != acting_user)
                .cloned()
                .collect(),
            SignPolicy::Any => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub version: u64,
    pub access_control: Option<AccessControl>,
}

#[derive(Debug, Clone)]
pub struct StoredValue {
    pub value: Vec<u8>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    pub tx_index: u64,
}

/// A transaction that has been closed for edits and is waiting for the
/// signatures of every party its writes require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub payload: Vec<u8>,
    pub signatures: BTreeMap<String, Vec<u8>>,
}

/// Per-user record registered by the admin during workload initialization.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub verification_key: [u8; 32],
    pub read_write_tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tx_timeout: Duration,
    pub query_timeout: Duration,
}

/// Creates the process-wide database handle.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> StoreResult<Arc<dyn KvDatabase>>;
}

#[async_trait]
pub trait KvDatabase: Send + Sync {
    async fn session(
        &self,
        user: &UserMaterial,
        config: &SessionConfig,
    ) -> StoreResult<Arc<dyn KvSession>>;
}

#[async_trait]
pub trait KvSession: Send + Sync {
    async fn data_tx(&self) -> StoreResult<Box<dyn DataTx>>;

    /// Re-opens a sealed and co-signed transaction so it can be committed.
    async fn load_data_tx(&self, envelope: TxEnvelope) -> StoreResult<Box<dyn DataTx>>;

    async fn query(&self) -> StoreResult<Box<dyn QueryHandle>>;

    async fn create_table(&self, table: &str) -> StoreResult<()>;

    async fn register_users(&self, users: Vec<UserRecord>) -> StoreResult<()>;
}

#[async_trait]
pub trait DataTx: Send {
    fn tx_id(&self) -> &str;

    async fn get(&mut self, table: &str, key: &str) -> StoreResult<Option<StoredValue>>;

    /// Adds `key` to the read set without fetching its value. Returns the
    /// committed version, if the key exists.
    async fn assert_read(&mut self, table: &str, key: &str) -> StoreResult<Option<u64>>;

    async fn put(
        &mut self,
        table: &str,
        key: &str,
        value: Vec<u8>,
        acl: Option<AccessControl>,
    ) -> StoreResult<()>;

    /// Closes the transaction and returns its envelope, signed by the session
    /// user. The handle is spent afterwards.
    async fn seal(&mut self) -> StoreResult<TxEnvelope>;

    async fn commit(&mut self, sync: bool) -> StoreResult<(String, TxReceipt)>;

    /// Fails with [StoreError::TxSpent] if the transaction was already
    /// committed, sealed or aborted.
    async fn abort(&mut self) -> StoreResult<()>;
}

#[async_trait]
pub trait QueryHandle: Send {
    async fn range(
        &mut self,
        table: &str,
        start_key: &str,
        end_key: Option<&str>,
        limit: u64,
    ) -> StoreResult<Box<dyn RangeCursor>>;
}

/// Results of a range query. Entries may be fetched lazily, so callers drain
/// the cursor to completion.
#[async_trait]
pub trait RangeCursor: Send {
    async fn next(&mut self) -> StoreResult<Option<(String, StoredValue)>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_full_is_matched_case_insensitively() {
        assert!(is_queue_full_message("Transaction queue is full"));
        assert!(is_queue_full_message("error: TRANSACTION QUEUE IS FULL, retry"));
        assert!(!is_queue_full_message("queue is empty"));
        assert!(StoreError::Rejected("transaction queue is full".into()).is_queue_full());
        assert!(!StoreError::TxSpent.is_queue_full());
    }

    #[test]
    fn co_signers_exclude_acting_user() {
        let acl = AccessControl::owned_by(["user-0", "user-1", "user-2"]);
        let signers = acl.co_signers("user-0");
        assert_eq!(
            signers.into_iter().collect::<Vec<_>>(),
            vec!["user-1".to_string(), "user-2".to_string()]
        );

        let any = AccessControl {
            sign_policy_for_write: SignPolicy::Any,
            ..AccessControl::owned_by(["user-0", "user-1"])
        };
        assert!(any.co_signers("user-0").is_empty());
    }
}
