// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

pub type BenchResult<T> = Result<T, BenchError>;

/// Errors that make a benchmark meaningless. They are raised while the run is
/// being constructed, never from inside the worker loop.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("invalid operation distribution: {0}")]
    InvalidDistribution(String),

    #[error("missing workload parameter '{0}'")]
    MissingParameter(String),

    #[error("workload parameter '{key}' has malformed value '{value}': {reason}")]
    MalformedParameter {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unknown workload '{name}', expected one of: {known}")]
    UnknownWorkload { name: String, known: String },

    #[error("invalid configuration file {file}: {message}")]
    InvalidFile { file: String, message: String },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum BenchError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("required co-signer '{0}' is not available")]
    MissingSigner(String),

    #[error("{} transaction(s) failed to commit: {}", .0.len(), join_errors(.0))]
    CommitFailed(Vec<StoreError>),

    #[error("exponential backoff stopped for user {user} after {elapsed:?}")]
    BackoffExhausted { user: String, elapsed: Duration },

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("worker for user {user} terminated abnormally: {message}")]
    WorkerAborted { user: String, message: String },

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn join_errors(errors: &[StoreError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl BenchError {
    /// Errors after which the whole run has to be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::Config(_)
                | BenchError::BackoffExhausted { .. }
                | BenchError::Metrics(_)
                | BenchError::WorkerAborted { .. }
        )
    }
}
