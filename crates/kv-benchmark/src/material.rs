// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Identities of the simulated users and the admin.
//!
//! Material is generated deterministically from a seed so that every worker
//! process of a distributed run derives the same keys for the same user.

use std::collections::HashMap;
use std::sync::Arc;

use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::store::UserRecord;

pub const ADMIN_USER: &str = "admin";

#[derive(Clone)]
pub struct UserMaterial {
    index: Option<u64>,
    name: String,
    signing_key: SigningKey,
}

impl std::fmt::Debug for UserMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserMaterial")
            .field("index", &self.index)
            .field("name", &self.name)
            .finish()
    }
}

impl UserMaterial {
    fn generate(index: Option<u64>, name: String, seed: u64) -> Self {
        let user_seed = seed ^ index.map_or(u64::MAX, |i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let mut rng = StdRng::seed_from_u64(user_seed);
        Self {
            index,
            name,
            signing_key: SigningKey::new(&mut rng),
        }
    }

    pub fn index(&self) -> Option<u64> {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn verification_key(&self) -> VerificationKey {
        self.signing_key.verification_key()
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.signing_key.sign(msg).to_bytes().to_vec()
    }

    pub fn record(&self, tables: &[&str]) -> UserRecord {
        UserRecord {
            id: self.name.clone(),
            verification_key: self.verification_key().to_bytes(),
            read_write_tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Verifies a signature produced by [UserMaterial::sign].
pub fn verify_signature(verification_key: &[u8; 32], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerificationKey::try_from(*verification_key) else {
        return false;
    };
    let Ok(bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    vk.verify(&Signature::from(bytes), msg).is_ok()
}

pub fn user_name(index: u64) -> String {
    format!("user-{index}")
}

#[derive(Debug, Clone)]
pub struct BenchMaterial {
    admin: Arc<UserMaterial>,
    users: Vec<Arc<UserMaterial>>,
    by_name: HashMap<String, Arc<UserMaterial>>,
}

impl BenchMaterial {
    pub fn generate(user_count: u64, seed: u64) -> Self {
        let admin = Arc::new(UserMaterial::generate(None, ADMIN_USER.to_string(), seed));
        let users = (0..user_count)
            .map(|i| Arc::new(UserMaterial::generate(Some(i), user_name(i), seed)))
            .collect();
        Self::from_parts(admin, users)
    }

    pub fn from_parts(admin: Arc<UserMaterial>, users: Vec<Arc<UserMaterial>>) -> Self {
        let by_name = users
            .iter()
            .chain(std::iter::once(&admin))
            .map(|u| (u.name().to_string(), u.clone()))
            .collect();
        Self {
            admin,
            users,
            by_name,
        }
    }

    pub fn admin(&self) -> &Arc<UserMaterial> {
        &self.admin
    }

    pub fn user(&self, index: u64) -> Option<&Arc<UserMaterial>> {
        self.users.get(usize::try_from(index).ok()?)
    }

    pub fn all_users(&self) -> &[Arc<UserMaterial>] {
        &self.users
    }

    pub fn user_count(&self) -> u64 {
        self.users.len() as u64
    }

    /// Looks up the signing credential of a co-signer by name.
    pub fn signer(&self, name: &str) -> Option<&Arc<UserMaterial>> {
        self.by_name.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let a = BenchMaterial::generate(3, 7);
        let b = BenchMaterial::generate(3, 7);
        for (x, y) in a.all_users().iter().zip(b.all_users()) {
            assert_eq!(x.name(), y.name());
            assert_eq!(
                x.verification_key().to_bytes(),
                y.verification_key().to_bytes()
            );
        }
        assert_ne!(
            a.user(0).unwrap().verification_key().to_bytes(),
            a.user(1).unwrap().verification_key().to_bytes()
        );
    }

    #[test]
    fn signatures_verify_against_registered_key() {
        let material = BenchMaterial::generate(2, 1);
        let user = material.user(1).unwrap();
        let sig = user.sign(b"payload");
        let vk = user.verification_key().to_bytes();
        assert!(verify_signature(&vk, b"payload", &sig));
        assert!(!verify_signature(&vk, b"tampered", &sig));
        assert!(material.signer("user-1").is_some());
        assert!(material.signer(ADMIN_USER).is_some());
        assert!(material.signer("user-9").is_none());
    }
}
