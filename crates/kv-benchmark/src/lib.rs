// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Load generator for transactional key-value stores. Each simulated user
//! runs in its own task and issues a configurable mix of reads, writes and
//! range queries against its own slice of the key space.

pub mod config;
pub mod drivers;
pub mod error;
pub mod local_store;
pub mod material;
pub mod metrics;
pub mod session_cache;
pub mod stats;
pub mod store;
pub mod workloads;

pub use config::{BenchmarkConfig, WorkloadConfig};
pub use drivers::bench_driver::{RunReport, WorkloadCoordinator};
pub use drivers::user_worker::UserWorker;
pub use error::{BenchError, BenchResult, ConfigError};
pub use local_store::LocalStore;
pub use material::BenchMaterial;
