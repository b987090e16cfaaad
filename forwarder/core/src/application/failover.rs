// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Failover Controller
//!
//! Reacts to the eviction of a server rank by moving every projection of the
//! affected group either through capability migration or offline.
//!
//! ## Eviction of rank R
//! 1. Swap the group's primary service rank from R to the head of the live
//!    rank list. With no usable rank list the group is disabled and all of its
//!    projections go offline.
//! 2. Per projection: failover-capable ones enter `MigrationInProgress`, take
//!    the capability lock for the whole migration and mark handles issued by
//!    R not live. The others go offline, keeping the lock until every
//!    projection has been processed.
//! 3. One re-registration RPC to the new PSR, guarded by a barrier permit on
//!    each waiting projection.
//! 4. On the reply, install the new root capability, plan which inodes
//!    migrate and start migrating from the root's children downwards.
//! 5. Every migration RPC holds one barrier permit from just before its send
//!    until its own completion (or its synchronous send failure).
//! 6. The last permit out releases the lock, drops invalidated inodes and
//!    resends the requests deferred while the migration ran.
//!
//! Eviction handling and migration completion are serialized per controller,
//! so a second eviction sees a projection either still migrating (lock held)
//! or back in `Running`. Evicted ranks are remembered and never elected.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Eviction handling and capability migration

use crate::application::request_lifecycle::RequestDispatcher;
use crate::domain::capability::Rank;
use crate::domain::events::{EventPublisher, FailoverEvent};
use crate::domain::membership::{GroupMembership, ServiceGroup};
use crate::domain::projection::{MigrationExit, OfflineReason, Projection};
use crate::domain::transport::{Completion, InodeNum, Opcode, RpcReply, Transport, TransportError};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct FailoverController {
    group: Arc<ServiceGroup>,
    membership: Arc<dyn GroupMembership>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<RequestDispatcher>,
    events: Arc<dyn EventPublisher>,
    projections: RwLock<Vec<Arc<Projection>>>,
    /// Held across `on_rank_evicted` and `complete`. Reentrant because a
    /// synchronous send failure completes a migration inside the handler.
    serial: ReentrantMutex<()>,
    evicted: Mutex<BTreeSet<Rank>>,
}

impl FailoverController {
    pub fn new(
        group: Arc<ServiceGroup>,
        membership: Arc<dyn GroupMembership>,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<RequestDispatcher>,
        events: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            group,
            membership,
            transport,
            dispatcher,
            events,
            projections: RwLock::new(Vec::new()),
            serial: ReentrantMutex::new(()),
            evicted: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn group(&self) -> &Arc<ServiceGroup> {
        &self.group
    }

    pub fn register_projection(&self, projection: Arc<Projection>) {
        debug!("Registered projection {} ({})", projection.id(), projection.name());
        self.projections.write().push(projection);
    }

    pub fn projections(&self) -> Vec<Arc<Projection>> {
        self.projections.read().clone()
    }

    pub fn projection(&self, id: u32) -> Option<Arc<Projection>> {
        self.projections.read().iter().find(|p| p.id() == id).cloned()
    }

    /// Administrative online/offline switch for one projection.
    pub fn set_online(&self, projection_id: u32, online: bool) -> bool {
        let Some(projection) = self.projection(projection_id) else {
            return false;
        };
        if online {
            projection.set_online(true);
        } else {
            self.go_offline(&projection, OfflineReason::HostDown);
        }
        true
    }

    /// Entry point for the cluster membership layer.
    pub fn on_rank_evicted(self: &Arc<Self>, group: &str, rank: Rank) {
        if group != self.group.name() {
            debug!("Ignoring eviction of rank {} in unrelated group {}", rank, group);
            return;
        }
        let _serial = self.serial.lock();
        info!("Rank {} evicted from group {}", rank, group);
        self.evicted.lock().insert(rank);

        let primary = self.elect_primary(group, rank);

        self.events.publish_failover_event(FailoverEvent::RankEvicted {
            group: group.to_string(),
            rank,
            primary_rank: primary,
            evicted_at: Utc::now(),
        });

        let projections = self.projections();

        let Some(primary) = primary else {
            error!("Group {} has no usable ranks, disabling it", group);
            self.group.disable();
            for projection in &projections {
                invalidate_handles(projection, rank);
                self.go_offline(projection, OfflineReason::HostDown);
            }
            return;
        };
        info!("Primary service rank for {} is now {}", group, primary);

        let mut waiting = Vec::new();
        let mut parked = Vec::new();

        for projection in &projections {
            if projection.is_offline() {
                continue;
            }

            if projection.failover_enabled() && !projection.begin_migration() {
                continue;
            }
            if !projection.hold_caps() {
                // A migration from an earlier eviction owns the lock and
                // carries on; only the newly dead handles need marking.
                let count = invalidate_handles(projection, rank);
                info!(
                    "Projection {} already migrating, {} more handles invalidated",
                    projection.id(),
                    count
                );
                continue;
            }
            let count = projection
                .with_held(|table| table.invalidate_rank(rank))
                .unwrap_or(0);

            if !projection.failover_enabled() {
                info!(
                    "Projection {} ({}) has failover disabled",
                    projection.id(),
                    projection.name()
                );
                self.go_offline(projection, OfflineReason::HostDown);
                parked.push(Arc::clone(projection));
                continue;
            }

            projection.arm_migration_barrier();
            info!(
                "Projection {} ({}) migrating, {} handles invalidated",
                projection.id(),
                projection.name(),
                count
            );
            self.events.publish_failover_event(FailoverEvent::MigrationStarted {
                projection_id: projection.id(),
                evicted_rank: rank,
                invalidated_handles: count,
                started_at: Utc::now(),
            });
            waiting.push(Arc::clone(projection));
        }

        if !waiting.is_empty() {
            self.send_registration(waiting, primary);
        }

        for projection in parked {
            projection.release_caps();
        }
    }

    /// Swap the PSR away from `evicted` and make sure the result is alive.
    fn elect_primary(&self, group: &str, evicted: Rank) -> Option<Rank> {
        let ranks = match self.membership.primary_ranks(group) {
            Ok(ranks) => ranks,
            Err(e) => {
                warn!("Rank list unavailable: {}", e);
                return None;
            }
        };
        let live: Vec<Rank> = {
            let dead = self.evicted.lock();
            ranks.into_iter().filter(|r| !dead.contains(r)).collect()
        };
        let first = *live.first()?;

        let mut primary = self.group.replace_primary(evicted, first);
        // The PSR may itself be a rank whose eviction is not handled yet.
        if !live.contains(&primary) {
            primary = self.group.replace_primary(primary, first);
        }
        Some(primary)
    }

    fn send_registration(self: &Arc<Self>, waiting: Vec<Arc<Projection>>, primary: Rank) {
        let mut rpc = match self.transport.create_request(Opcode::Register, Some(primary)) {
            Ok(rpc) => rpc,
            Err(e) => {
                error!("Could not create re-registration RPC: {}", e);
                self.abandon(&waiting, OfflineReason::HostDown);
                return;
            }
        };
        if let Err(e) = self.transport.set_destination(&mut rpc, primary) {
            error!("Could not address re-registration RPC to rank {}: {}", primary, e);
            self.abandon(&waiting, OfflineReason::HostDown);
            return;
        }

        let controller = Arc::clone(self);
        let projections = waiting.clone();
        let completion: Completion =
            Box::new(move |result: Result<RpcReply, TransportError>| controller.on_registered(projections, result));

        if let Err(e) = self.transport.send(rpc, completion) {
            error!("Could not send re-registration RPC to rank {}: {}", primary, e);
            self.abandon(&waiting, OfflineReason::HostDown);
        }
    }

    /// Take waiting projections offline and return their registration permit.
    fn abandon(self: &Arc<Self>, waiting: &[Arc<Projection>], reason: OfflineReason) {
        for projection in waiting {
            self.go_offline(projection, reason);
            self.release(projection);
        }
    }

    fn on_registered(
        self: &Arc<Self>,
        waiting: Vec<Arc<Projection>>,
        result: Result<RpcReply, TransportError>,
    ) {
        let exports = match result {
            Ok(RpcReply::Exports(exports)) => exports,
            Ok(other) => {
                error!("Unexpected re-registration reply: {:?}", other);
                self.abandon(&waiting, OfflineReason::InvalidArgument);
                return;
            }
            Err(e) => {
                error!("Re-registration failed: {}", e);
                self.abandon(&waiting, OfflineReason::HostDown);
                return;
            }
        };

        for projection in &waiting {
            if projection.is_offline() {
                info!("Projection {} went offline during re-registration", projection.id());
                self.release(projection);
                continue;
            }
            match exports.iter().find(|export| export.name == projection.name()) {
                Some(export) => {
                    let roots = projection
                        .with_held(|table| {
                            table.set_root(export.root);
                            table.plan_migration()
                        })
                        .unwrap_or_default();
                    debug!(
                        "Projection {} new root {}, {} top-level inodes to migrate",
                        projection.id(),
                        export.root,
                        roots.len()
                    );
                    for ino in roots {
                        self.migrate_inode(projection, ino);
                    }
                }
                None => {
                    error!("Export {} missing after re-registration", projection.name());
                    self.go_offline(projection, OfflineReason::Io);
                }
            }
            self.release(projection);
        }
    }

    fn migrate_inode(self: &Arc<Self>, projection: &Arc<Projection>, ino: InodeNum) {
        let Some(target) = projection
            .with_held(|table| table.migration_target(ino))
            .flatten()
        else {
            return;
        };

        let primary = self.group.primary_rank();
        projection.add_migration_ref();

        let mut rpc = match self.transport.create_request(Opcode::Migrate, Some(primary)) {
            Ok(rpc) => rpc,
            Err(e) => {
                warn!("Could not create migration RPC for inode {}: {}", ino, e);
                self.migration_failed(projection, ino);
                self.release(projection);
                return;
            }
        };
        if let Err(e) = self.transport.set_destination(&mut rpc, primary) {
            warn!("Could not address migration RPC for inode {}: {}", ino, e);
            self.migration_failed(projection, ino);
            self.release(projection);
            return;
        }

        let payload = rpc.payload_mut();
        payload.capability = target.capability;
        payload.name = target.name;
        payload.inode = ino;

        let controller = Arc::clone(self);
        let owner = Arc::clone(projection);
        let completion: Completion =
            Box::new(move |result: Result<RpcReply, TransportError>| controller.on_migrated(&owner, ino, result));

        if let Err(e) = self.transport.send(rpc, completion) {
            warn!("Could not send migration RPC for inode {}: {}", ino, e);
            self.migration_failed(projection, ino);
            self.release(projection);
        }
    }

    fn on_migrated(
        self: &Arc<Self>,
        projection: &Arc<Projection>,
        ino: InodeNum,
        result: Result<RpcReply, TransportError>,
    ) {
        match result {
            Ok(RpcReply::Entry(entry)) if entry.attr.ino == ino => {
                let children = projection
                    .with_held(|table| table.install_migrated(ino, entry.capability))
                    .unwrap_or_default();
                debug!("Inode {} migrated to {}", ino, entry.capability);
                for child in children {
                    self.migrate_inode(projection, child);
                }
            }
            Ok(RpcReply::Failed(status)) => {
                info!("Inode {} not migrated: {}", ino, status);
                self.migration_failed(projection, ino);
            }
            Ok(other) => {
                warn!("Unexpected migration reply for inode {}: {:?}", ino, other);
                self.migration_failed(projection, ino);
            }
            Err(e) => {
                warn!("Migration RPC for inode {} failed: {}", ino, e);
                self.migration_failed(projection, ino);
            }
        }
        self.release(projection);
    }

    fn migration_failed(&self, projection: &Projection, ino: InodeNum) {
        let count = projection
            .with_held(|table| table.abandon_subtree(ino))
            .unwrap_or(0);
        debug!("Inode {} and {} descendants queued for invalidation", ino, count.saturating_sub(1));
    }

    /// Return one barrier permit; the last one completes the migration.
    fn release(self: &Arc<Self>, projection: &Arc<Projection>) {
        if projection.release_migration_ref() {
            self.complete(projection);
        }
    }

    fn complete(self: &Arc<Self>, projection: &Arc<Projection>) {
        // No eviction may start between releasing the lock and settling.
        let _serial = self.serial.lock();
        let summary = projection
            .with_held(|table| table.finish_migration())
            .unwrap_or_default();
        projection.release_caps();

        match projection.finish_migration() {
            MigrationExit::Offline(deferred, reason) => {
                projection.process_invalidations(&summary.invalidated);
                let failed = self.dispatcher.fail_all(deferred, reason);
                info!(
                    "Projection {} migration ended offline, {} deferred requests failed",
                    projection.id(),
                    failed
                );
            }
            MigrationExit::Completed(deferred) => {
                info!(
                    "Projection {} failover complete: {} inodes migrated, {} invalidated",
                    projection.id(),
                    summary.migrated,
                    summary.invalidated.len()
                );
                projection.process_invalidations(&summary.invalidated);

                let resent = deferred.len();
                for request in deferred {
                    self.dispatcher.resend(request);
                }
                projection.settle();

                self.events.publish_failover_event(FailoverEvent::MigrationCompleted {
                    projection_id: projection.id(),
                    migrated_inodes: summary.migrated,
                    invalidated_inodes: summary.invalidated.len(),
                    resent_requests: resent,
                    completed_at: Utc::now(),
                });
            }
        }
    }

    fn go_offline(&self, projection: &Projection, reason: OfflineReason) {
        let deferred = projection.mark_offline(reason);
        let failed = self.dispatcher.fail_all(deferred, reason);
        self.events.publish_failover_event(FailoverEvent::ProjectionOffline {
            projection_id: projection.id(),
            reason,
            failed_requests: failed,
            offline_at: Utc::now(),
        });
    }
}

/// Mark handles issued by `rank` not live, through the migration guard if a
/// migration holds the lock.
fn invalidate_handles(projection: &Projection, rank: Rank) -> usize {
    match projection.with_held(|table| table.invalidate_rank(rank)) {
        Some(count) => count,
        None => projection.lock_caps().invalidate_rank(rank),
    }
}
