// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::material::UserMaterial;
use crate::store::{Connector, KvDatabase, KvSession, SessionConfig, StoreResult};

/// Process-wide cache of the database handle and of one session per user.
///
/// Both are created at most once: concurrent first callers race on a
/// [OnceCell], a single one runs the initializer and everyone observes its
/// result. A failed initialization leaves the cell empty so a later call can
/// try again.
pub struct SessionCache {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    db: OnceCell<Arc<dyn KvDatabase>>,
    sessions: DashMap<String, Arc<OnceCell<Arc<dyn KvSession>>>>,
}

impl SessionCache {
    pub fn new(connector: Arc<dyn Connector>, config: SessionConfig) -> Self {
        Self {
            connector,
            config,
            db: OnceCell::new(),
            sessions: DashMap::new(),
        }
    }

    pub async fn database(&self) -> StoreResult<Arc<dyn KvDatabase>> {
        self.db
            .get_or_try_init(|| async {
                debug!("Connecting to the database");
                self.connector.connect().await
            })
            .await
            .cloned()
    }

    pub async fn session(&self, user: &UserMaterial) -> StoreResult<Arc<dyn KvSession>> {
        // Clone the cell out so the map shard is not locked across the await.
        let cell = self
            .sessions
            .entry(user.name().to_string())
            .or_default()
            .value()
            .clone();
        cell.get_or_try_init(|| async {
            let db = self.database().await?;
            debug!("Opening session for {}", user.name());
            db.session(user, &self.config).await
        })
        .await
        .cloned()
    }
}
