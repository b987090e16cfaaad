// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Server group membership
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Cached primary service rank (PSR) of a server group and the
//!   port used to ask the cluster for the current rank list

use crate::domain::capability::Rank;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("Group {0} has no reachable members")]
    NoMembers(String),

    #[error("Rank list for group {group} unavailable: {reason}")]
    Unavailable { group: String, reason: String },
}

/// Source of the live rank list for a server group.
pub trait GroupMembership: Send + Sync {
    /// Ranks that can act as primary, preferred first.
    fn primary_ranks(&self, group: &str) -> Result<Vec<Rank>, MembershipError>;
}

/// Client-side view of one server group.
#[derive(Debug)]
pub struct ServiceGroup {
    name: String,
    primary: AtomicU32,
    enabled: AtomicBool,
}

impl ServiceGroup {
    pub fn new(name: impl Into<String>, primary: Rank) -> Self {
        Self {
            name: name.into(),
            primary: AtomicU32::new(primary),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_rank(&self) -> Rank {
        self.primary.load(Ordering::Acquire)
    }

    /// Swap the PSR from `evicted` to `replacement`.
    ///
    /// Returns the PSR in effect afterwards. If another eviction already
    /// moved the PSR away from `evicted`, that value is kept.
    pub fn replace_primary(&self, evicted: Rank, replacement: Rank) -> Rank {
        match self.primary.compare_exchange(
            evicted,
            replacement,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => replacement,
            Err(current) => current,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}
