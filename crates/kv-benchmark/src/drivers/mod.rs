// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

pub mod backoff;
pub mod bench_driver;
pub mod user_worker;
