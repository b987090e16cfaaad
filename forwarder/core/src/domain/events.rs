// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::capability::Rank;
use crate::domain::projection::OfflineReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failover lifecycle events
///
/// Published by the failover controller so operators and tests can follow an
/// eviction from PSR change to migration completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailoverEvent {
    RankEvicted {
        group: String,
        rank: Rank,
        /// PSR after the eviction, `None` if the group has no members left
        primary_rank: Option<Rank>,
        evicted_at: DateTime<Utc>,
    },
    MigrationStarted {
        projection_id: u32,
        evicted_rank: Rank,
        invalidated_handles: usize,
        started_at: DateTime<Utc>,
    },
    MigrationCompleted {
        projection_id: u32,
        migrated_inodes: usize,
        invalidated_inodes: usize,
        resent_requests: usize,
        completed_at: DateTime<Utc>,
    },
    ProjectionOffline {
        projection_id: u32,
        reason: OfflineReason,
        failed_requests: usize,
        offline_at: DateTime<Utc>,
    },
}

impl FailoverEvent {
    /// Projection the event concerns, if it is projection-scoped.
    pub fn projection_id(&self) -> Option<u32> {
        match self {
            FailoverEvent::RankEvicted { .. } => None,
            FailoverEvent::MigrationStarted { projection_id, .. }
            | FailoverEvent::MigrationCompleted { projection_id, .. }
            | FailoverEvent::ProjectionOffline { projection_id, .. } => Some(*projection_id),
        }
    }
}

/// Sink for failover events.
pub trait EventPublisher: Send + Sync {
    fn publish_failover_event(&self, event: FailoverEvent);
}
