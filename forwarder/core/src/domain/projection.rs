// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Projection - one client-mounted export backed by a server group
//!
//! Holds the client object records (cached inodes, open files, open
//! directories) together with the capability each one last received from a
//! server, and the failover state of the mount.
//!
//! ## Locking
//! - `caps` is the capability-mutation lock. Every read or write of a cached
//!   capability or validity flag happens under it.
//! - During failover the controller takes an *owned* guard of `caps`
//!   ([`Projection::hold_caps`]) and parks it in `held` until the migration
//!   barrier fires, possibly on another thread. While parked, migration code
//!   reaches the table only through [`Projection::with_held`].
//! - `status` guards the failover state and the deferred-request queue as one
//!   unit, so a completion deciding to defer cannot race the barrier draining
//!   the queue.
//! - Lock order is `held` before `caps`; `status` is never held while taking
//!   either.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Client object records and per-mount failover state

use crate::domain::capability::{Capability, Rank};
use crate::domain::membership::ServiceGroup;
use crate::domain::request::{CapabilitySource, Request};
use crate::domain::transport::InodeNum;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, MutexGuard, RawMutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Well-known inode number of every projection's root.
pub const ROOT_INODE: InodeNum = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirId(pub u64);

/// Cached inode, one per name the kernel has looked up.
#[derive(Debug, Clone)]
pub struct InodeEntry {
    pub ino: InodeNum,
    pub parent: InodeNum,
    pub name: String,
    pub capability: Capability,
    pub valid: bool,
    pub lookup_refs: u64,
    failover: bool,
    children: Vec<InodeNum>,
}

#[derive(Debug, Clone)]
pub struct OpenFile {
    pub id: FileId,
    pub ino: InodeNum,
    pub capability: Capability,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct OpenDir {
    pub id: DirId,
    pub ino: InodeNum,
    pub capability: Capability,
    pub valid: bool,
    /// Server-side directory stream is still usable
    pub handle_valid: bool,
}

/// What a migration RPC carries for one inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTarget {
    pub inode: InodeNum,
    /// Parent capability, or the root capability when the parent is unusable
    pub capability: Capability,
    pub name: String,
}

/// Result of closing out a migration on the capability table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    pub migrated: usize,
    pub invalidated: Vec<InodeNum>,
}

/// Client object records guarded by the capability-mutation lock.
#[derive(Debug)]
pub struct CapabilityTable {
    root: Capability,
    inodes: HashMap<InodeNum, InodeEntry>,
    files: HashMap<FileId, OpenFile>,
    dirs: HashMap<DirId, OpenDir>,
    root_children: Vec<InodeNum>,
    invalidations: Vec<InodeNum>,
}

impl CapabilityTable {
    pub fn new(root: Capability) -> Self {
        Self {
            root,
            inodes: HashMap::new(),
            files: HashMap::new(),
            dirs: HashMap::new(),
            root_children: Vec::new(),
            invalidations: Vec::new(),
        }
    }

    pub fn root(&self) -> Capability {
        self.root
    }

    pub fn set_root(&mut self, capability: Capability) {
        self.root = capability;
    }

    pub fn inode(&self, ino: InodeNum) -> Option<&InodeEntry> {
        self.inodes.get(&ino)
    }

    pub fn file(&self, id: FileId) -> Option<&OpenFile> {
        self.files.get(&id)
    }

    pub fn dir(&self, id: DirId) -> Option<&OpenDir> {
        self.dirs.get(&id)
    }

    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub fn open_handle_count(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// Record a lookup reply. Each call holds one lookup reference.
    pub fn insert_inode(
        &mut self,
        ino: InodeNum,
        parent: InodeNum,
        name: impl Into<String>,
        capability: Capability,
    ) {
        let name = name.into();
        let entry = self.inodes.entry(ino).or_insert_with(|| InodeEntry {
            ino,
            parent,
            name: name.clone(),
            capability,
            valid: true,
            lookup_refs: 0,
            failover: false,
            children: Vec::new(),
        });
        entry.parent = parent;
        entry.name = name;
        entry.capability = capability;
        entry.valid = true;
        entry.lookup_refs += 1;
    }

    /// Drop `count` lookup references. Returns true once the entry is gone.
    pub fn forget_inode(&mut self, ino: InodeNum, count: u64) -> bool {
        let Some(entry) = self.inodes.get_mut(&ino) else {
            return true;
        };
        entry.lookup_refs = entry.lookup_refs.saturating_sub(count);
        if entry.lookup_refs == 0 {
            self.inodes.remove(&ino);
            return true;
        }
        false
    }

    pub fn insert_file(&mut self, id: FileId, ino: InodeNum, capability: Capability) {
        self.files.insert(
            id,
            OpenFile {
                id,
                ino,
                capability,
                valid: true,
            },
        );
    }

    pub fn remove_file(&mut self, id: FileId) -> Option<OpenFile> {
        self.files.remove(&id)
    }

    pub fn insert_dir(&mut self, id: DirId, ino: InodeNum, capability: Capability) {
        self.dirs.insert(
            id,
            OpenDir {
                id,
                ino,
                capability,
                valid: true,
                handle_valid: true,
            },
        );
    }

    pub fn remove_dir(&mut self, id: DirId) -> Option<OpenDir> {
        self.dirs.remove(&id)
    }

    /// Clear the validity flag of the object a request draws its
    /// capability from. Returns false if there is no such object.
    pub fn invalidate_source(&mut self, source: CapabilitySource) -> bool {
        match source {
            CapabilitySource::Inode(ino) | CapabilitySource::InodeNum(ino) => {
                match self.inodes.get_mut(&ino) {
                    Some(entry) => {
                        entry.valid = false;
                        true
                    }
                    None => false,
                }
            }
            CapabilitySource::File(id) => match self.files.get_mut(&id) {
                Some(file) => {
                    file.valid = false;
                    true
                }
                None => false,
            },
            CapabilitySource::Dir(id) => match self.dirs.get_mut(&id) {
                Some(dir) => {
                    dir.valid = false;
                    dir.handle_valid = false;
                    true
                }
                None => false,
            },
            CapabilitySource::None | CapabilitySource::Root => false,
        }
    }

    /// Mark every open file and directory handle issued by `rank` not live.
    pub fn invalidate_rank(&mut self, rank: Rank) -> usize {
        let mut count = 0;
        for file in self.files.values_mut() {
            if file.capability.root_rank() == rank && file.valid {
                debug!("Invalidating file handle {:?} ({})", file.id, file.capability);
                file.valid = false;
                count += 1;
            }
        }
        for dir in self.dirs.values_mut() {
            if dir.capability.root_rank() == rank && (dir.valid || dir.handle_valid) {
                debug!("Invalidating directory handle {:?} ({})", dir.id, dir.capability);
                dir.valid = false;
                dir.handle_valid = false;
                count += 1;
            }
        }
        count
    }

    /// Decide which cached inodes migrate.
    ///
    /// Every inode reachable upwards from an open file or directory is marked,
    /// and linked into its parent's child list so migration can proceed top
    /// down. Everything else is marked not live and queued for invalidation
    /// with one extra lookup reference held on its behalf. Returns the
    /// marked inodes whose parent is the root.
    pub fn plan_migration(&mut self) -> Vec<InodeNum> {
        self.root_children.clear();
        for entry in self.inodes.values_mut() {
            entry.failover = false;
            entry.children.clear();
        }

        let mut starts: Vec<InodeNum> = self.files.values().map(|f| f.ino).collect();
        starts.extend(self.dirs.values().map(|d| d.ino));
        for ino in starts {
            self.mark_path(ino);
        }

        let unmarked: Vec<InodeNum> = self
            .inodes
            .values()
            .filter(|entry| !entry.failover)
            .map(|entry| entry.ino)
            .collect();
        for ino in unmarked {
            self.queue_invalidation(ino);
        }

        self.root_children.clone()
    }

    /// Mark `start` and its ancestors, stopping at the first one already
    /// marked.
    fn mark_path(&mut self, start: InodeNum) {
        match self.inodes.get(&start) {
            Some(entry) if entry.valid && !entry.failover => {}
            Some(_) => return,
            None => {
                warn!("Open handle refers to uncached inode {}", start);
                return;
            }
        }

        let mut ino = start;
        loop {
            let parent = match self.inodes.get_mut(&ino) {
                Some(entry) => {
                    entry.failover = true;
                    entry.parent
                }
                None => return,
            };

            if parent == ROOT_INODE {
                self.root_children.push(ino);
                return;
            }

            match self.inodes.get_mut(&parent) {
                Some(parent_entry) => {
                    parent_entry.children.push(ino);
                    if parent_entry.failover {
                        return;
                    }
                    ino = parent;
                }
                None => {
                    // Without a cached parent the name can only be resolved
                    // from the root; the server rejects it if it does not match.
                    warn!("Inode {} has no cached parent {}, migrating from root", ino, parent);
                    self.root_children.push(ino);
                    return;
                }
            }
        }
    }

    fn queue_invalidation(&mut self, ino: InodeNum) {
        if let Some(entry) = self.inodes.get_mut(&ino) {
            entry.valid = false;
            entry.lookup_refs += 1;
            self.invalidations.push(ino);
        }
    }

    /// Payload for migrating `ino`, or `None` if it is not marked.
    pub fn migration_target(&self, ino: InodeNum) -> Option<MigrationTarget> {
        let entry = self.inodes.get(&ino)?;
        if !entry.failover {
            return None;
        }

        let parent_capability = if entry.parent == ROOT_INODE {
            None
        } else {
            self.inodes
                .get(&entry.parent)
                .filter(|parent| parent.valid)
                .map(|parent| parent.capability)
        };

        Some(MigrationTarget {
            inode: ino,
            capability: parent_capability.unwrap_or(self.root),
            name: entry.name.clone(),
        })
    }

    /// Install a migrated capability and return the children to migrate next.
    ///
    /// Open files on the inode are re-pointed at the new capability. Open
    /// directories get the new capability too, but their stream handle stays
    /// unusable since stream position does not survive a rank change.
    pub fn install_migrated(&mut self, ino: InodeNum, capability: Capability) -> Vec<InodeNum> {
        let Some(entry) = self.inodes.get_mut(&ino) else {
            return Vec::new();
        };
        entry.capability = capability;
        entry.valid = true;
        let children = entry.children.clone();

        for file in self.files.values_mut().filter(|f| f.ino == ino) {
            file.capability = capability;
            file.valid = true;
        }
        for dir in self.dirs.values_mut().filter(|d| d.ino == ino) {
            dir.capability = capability;
            dir.valid = true;
        }

        children
    }

    /// Give up on `ino` and every marked inode below it.
    ///
    /// Returns how many inodes were queued for invalidation.
    pub fn abandon_subtree(&mut self, ino: InodeNum) -> usize {
        let mut stack = vec![ino];
        let mut count = 0;

        while let Some(current) = stack.pop() {
            let Some(entry) = self.inodes.get_mut(&current) else {
                continue;
            };
            if !entry.failover {
                continue;
            }
            entry.failover = false;
            stack.append(&mut entry.children);
            self.queue_invalidation(current);
            count += 1;
        }
        count
    }

    /// Clear migration bookkeeping and hand over the invalidation list.
    pub fn finish_migration(&mut self) -> MigrationSummary {
        let mut migrated = 0;
        for entry in self.inodes.values_mut() {
            if entry.failover {
                migrated += 1;
            }
            entry.failover = false;
            entry.children.clear();
        }
        self.root_children.clear();

        MigrationSummary {
            migrated,
            invalidated: std::mem::take(&mut self.invalidations),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidateError {
    #[error("Entry not found")]
    NotFound,

    #[error("Entry invalidation failed: {0}")]
    Failed(String),
}

/// Adapter-layer hook that tells the kernel a directory entry is stale.
pub trait EntryInvalidator: Send + Sync {
    fn invalidate_entry(&self, parent: InodeNum, name: &str) -> Result<(), InvalidateError>;
}

/// Why a projection went offline. Requests against it fail with this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineReason {
    HostDown,
    InvalidArgument,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailoverState {
    #[default]
    Running,
    MigrationInProgress,
    Complete,
    Offline(OfflineReason),
}

impl FailoverState {
    /// Name reported through the control interface.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverState::Running => "running",
            FailoverState::MigrationInProgress => "in_progress",
            FailoverState::Complete => "complete",
            FailoverState::Offline(_) => "offline",
        }
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision on whether a request may go out now.
pub enum Admission {
    Proceed(Box<Request>),
    /// Queued until the running migration completes
    Deferred,
    Offline(Box<Request>, OfflineReason),
}

/// How a migration ended for one projection.
pub enum MigrationExit {
    /// Now `Complete`; these deferred requests must be resent
    Completed(Vec<Box<Request>>),
    /// Went offline meanwhile; these deferred requests must fail
    Offline(Vec<Box<Request>>, OfflineReason),
}

#[derive(Default)]
struct ProjectionStatus {
    state: FailoverState,
    deferred: VecDeque<Box<Request>>,
}

type HeldTable = ArcMutexGuard<RawMutex, CapabilityTable>;

pub struct Projection {
    id: u32,
    name: String,
    group: Arc<ServiceGroup>,
    failover_enabled: bool,
    caps: Arc<Mutex<CapabilityTable>>,
    held: Mutex<Option<HeldTable>>,
    migration_refs: AtomicUsize,
    next_handle: AtomicU64,
    status: Mutex<ProjectionStatus>,
    invalidator: Arc<dyn EntryInvalidator>,
}

impl Projection {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        group: Arc<ServiceGroup>,
        failover_enabled: bool,
        root: Capability,
        invalidator: Arc<dyn EntryInvalidator>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            group,
            failover_enabled,
            caps: Arc::new(Mutex::new(CapabilityTable::new(root))),
            held: Mutex::new(None),
            migration_refs: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            status: Mutex::new(ProjectionStatus::default()),
            invalidator,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &Arc<ServiceGroup> {
        &self.group
    }

    pub fn failover_enabled(&self) -> bool {
        self.failover_enabled
    }

    // ---- capability-mutation lock ----

    pub fn lock_caps(&self) -> MutexGuard<'_, CapabilityTable> {
        self.caps.lock()
    }

    pub fn try_lock_caps(&self) -> Option<MutexGuard<'_, CapabilityTable>> {
        self.caps.try_lock()
    }

    /// Take the capability lock on behalf of a migration and keep it until
    /// [`Projection::release_caps`]. Returns false if already held.
    pub fn hold_caps(&self) -> bool {
        let mut held = self.held.lock();
        if held.is_some() {
            return false;
        }
        *held = Some(Mutex::lock_arc(&self.caps));
        true
    }

    /// Run `f` against the table through the parked migration guard.
    pub fn with_held<R>(&self, f: impl FnOnce(&mut CapabilityTable) -> R) -> Option<R> {
        let mut held = self.held.lock();
        held.as_deref_mut().map(f)
    }

    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    pub fn release_caps(&self) -> bool {
        let guard = self.held.lock().take();
        guard.is_some()
    }

    // ---- migration barrier ----

    /// Add the permit of the re-registration RPC.
    pub fn arm_migration_barrier(&self) {
        self.migration_refs.fetch_add(1, Ordering::AcqRel);
    }

    pub fn add_migration_ref(&self) {
        self.migration_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns true for the decrement that brings the count to zero.
    pub fn release_migration_ref(&self) -> bool {
        let previous = self.migration_refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "migration barrier released below zero");
        previous == 1
    }

    pub fn migration_refs(&self) -> usize {
        self.migration_refs.load(Ordering::Acquire)
    }

    // ---- failover state ----

    pub fn state(&self) -> FailoverState {
        self.status.lock().state
    }

    pub fn offline_reason(&self) -> Option<OfflineReason> {
        match self.state() {
            FailoverState::Offline(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline_reason().is_some()
    }

    pub fn deferred_len(&self) -> usize {
        self.status.lock().deferred.len()
    }

    /// Offline requests fail, requests during migration are parked, the rest
    /// proceed.
    pub fn admit(&self, request: Box<Request>) -> Admission {
        let mut status = self.status.lock();
        match status.state {
            FailoverState::Offline(reason) => Admission::Offline(request, reason),
            FailoverState::MigrationInProgress => {
                status.deferred.push_back(request);
                Admission::Deferred
            }
            FailoverState::Running | FailoverState::Complete => Admission::Proceed(request),
        }
    }

    /// Enter `MigrationInProgress`. Refused for an offline projection.
    pub fn begin_migration(&self) -> bool {
        let mut status = self.status.lock();
        if matches!(status.state, FailoverState::Offline(_)) {
            return false;
        }
        status.state = FailoverState::MigrationInProgress;
        true
    }

    /// Go offline and hand back every deferred request for failing.
    pub fn mark_offline(&self, reason: OfflineReason) -> Vec<Box<Request>> {
        let mut status = self.status.lock();
        if status.state != FailoverState::Offline(reason) {
            warn!("Projection {} ({}) offline: {:?}", self.id, self.name, reason);
        }
        status.state = FailoverState::Offline(reason);
        status.deferred.drain(..).collect()
    }

    /// Leave `MigrationInProgress` once the barrier has fired.
    pub fn finish_migration(&self) -> MigrationExit {
        let mut status = self.status.lock();
        let deferred = status.deferred.drain(..).collect();
        match status.state {
            FailoverState::Offline(reason) => MigrationExit::Offline(deferred, reason),
            _ => {
                status.state = FailoverState::Complete;
                MigrationExit::Completed(deferred)
            }
        }
    }

    /// `Complete → Running` once deferred work has been resubmitted.
    pub fn settle(&self) {
        let mut status = self.status.lock();
        if status.state == FailoverState::Complete {
            status.state = FailoverState::Running;
        }
    }

    /// Administrative switch. Returns deferred requests when taking the
    /// projection offline.
    pub fn set_online(&self, online: bool) -> Vec<Box<Request>> {
        if !online {
            return self.mark_offline(OfflineReason::HostDown);
        }

        let mut status = self.status.lock();
        if matches!(status.state, FailoverState::Offline(_)) {
            info!("Projection {} ({}) re-enabled", self.id, self.name);
            status.state = FailoverState::Running;
            self.group.enable();
        }
        Vec::new()
    }

    // ---- object records ----

    pub fn root_capability(&self) -> Capability {
        self.lock_caps().root()
    }

    pub fn insert_inode(
        &self,
        ino: InodeNum,
        parent: InodeNum,
        name: impl Into<String>,
        capability: Capability,
    ) {
        self.lock_caps().insert_inode(ino, parent, name, capability);
    }

    pub fn forget_inode(&self, ino: InodeNum, count: u64) -> bool {
        self.lock_caps().forget_inode(ino, count)
    }

    pub fn open_file(&self, ino: InodeNum, capability: Capability) -> FileId {
        let id = FileId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.lock_caps().insert_file(id, ino, capability);
        id
    }

    pub fn release_file(&self, id: FileId) -> Option<OpenFile> {
        self.lock_caps().remove_file(id)
    }

    pub fn open_dir(&self, ino: InodeNum, capability: Capability) -> DirId {
        let id = DirId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.lock_caps().insert_dir(id, ino, capability);
        id
    }

    pub fn release_dir(&self, id: DirId) -> Option<OpenDir> {
        self.lock_caps().remove_dir(id)
    }

    /// Drop the references held by the invalidation list.
    ///
    /// Inodes the kernel still references beyond the list's own reference
    /// get their directory entry invalidated; if the kernel no longer knows
    /// the entry, its references are dropped here as well. Returns the
    /// number of entries notified.
    pub fn process_invalidations(&self, inodes: &[InodeNum]) -> usize {
        let mut notified = 0;

        for &ino in inodes {
            let target = self
                .lock_caps()
                .inode(ino)
                .map(|entry| (entry.parent, entry.name.clone(), entry.lookup_refs));
            let Some((parent, name, refs)) = target else {
                continue;
            };

            let mut drop_count = 1;
            if refs > 1 {
                notified += 1;
                match self.invalidator.invalidate_entry(parent, &name) {
                    Ok(()) => debug!("Invalidated entry {} under {}", name, parent),
                    Err(InvalidateError::NotFound) => drop_count += refs - 1,
                    Err(e) => warn!("Could not invalidate entry {} under {}: {}", name, parent, e),
                }
            }

            if self.lock_caps().forget_inode(ino, drop_count) {
                debug!("Dropped inode {} after failover", ino);
            }
        }
        notified
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group", &self.group.name())
            .field("failover_enabled", &self.failover_enabled)
            .field("migration_refs", &self.migration_refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl EntryInvalidator for Quiet {
        fn invalidate_entry(&self, _parent: InodeNum, _name: &str) -> Result<(), InvalidateError> {
            Ok(())
        }
    }

    fn cap(root: u8, fid: u32) -> Capability {
        Capability {
            revision: 1,
            root,
            version: 1,
            fid,
            ..Capability::NULL
        }
        .sealed()
    }

    /// root ── a(2) ── b(3) ── c(4)
    ///      └─ d(5)
    ///      └─ e(6) ── f(7)
    fn populated() -> CapabilityTable {
        let mut table = CapabilityTable::new(cap(0, 0));
        table.insert_inode(2, ROOT_INODE, "a", cap(0, 2));
        table.insert_inode(3, 2, "b", cap(0, 3));
        table.insert_inode(4, 3, "c", cap(0, 4));
        table.insert_inode(5, ROOT_INODE, "d", cap(0, 5));
        table.insert_inode(6, ROOT_INODE, "e", cap(0, 6));
        table.insert_inode(7, 6, "f", cap(0, 7));
        table
    }

    #[test]
    fn test_invalidate_rank_only_touches_that_rank() {
        let mut table = populated();
        table.insert_file(FileId(1), 4, cap(0, 40));
        table.insert_file(FileId(2), 7, cap(1, 70));
        table.insert_dir(DirId(3), 2, cap(0, 20));

        assert_eq!(table.invalidate_rank(0), 2);
        assert!(!table.file(FileId(1)).unwrap().valid);
        assert!(table.file(FileId(2)).unwrap().valid);
        assert!(!table.dir(DirId(3)).unwrap().handle_valid);

        // Second pass finds nothing new.
        assert_eq!(table.invalidate_rank(0), 0);
    }

    #[test]
    fn test_plan_marks_paths_from_open_handles() {
        let mut table = populated();
        table.insert_file(FileId(1), 4, cap(0, 40));
        table.insert_file(FileId(2), 3, cap(0, 30));

        let roots = table.plan_migration();
        assert_eq!(roots, vec![2]);

        assert_eq!(table.migration_target(2).unwrap().name, "a");
        assert!(table.migration_target(3).is_some());
        assert!(table.migration_target(4).is_some());

        // d, e and f are not reachable from any open handle.
        for ino in [5, 6, 7] {
            let entry = table.inode(ino).unwrap();
            assert!(!entry.valid);
            assert_eq!(entry.lookup_refs, 2);
            assert!(table.migration_target(ino).is_none());
        }

        // b is linked under a exactly once even though two walks reached it.
        assert_eq!(table.install_migrated(2, cap(1, 2)), vec![3]);
        assert_eq!(table.install_migrated(3, cap(1, 3)), vec![4]);
    }

    #[test]
    fn test_migration_target_prefers_valid_parent() {
        let mut table = populated();
        table.insert_file(FileId(1), 4, cap(0, 40));
        table.plan_migration();

        // Root-level child always goes through the root capability.
        assert_eq!(table.migration_target(2).unwrap().capability, cap(0, 0));

        table.install_migrated(2, cap(1, 2));
        assert_eq!(table.migration_target(3).unwrap().capability, cap(1, 2));

        // Parent not live: fall back to the root capability.
        table.inodes.get_mut(&3).unwrap().valid = false;
        let target = table.migration_target(4).unwrap();
        assert_eq!(target.capability, cap(0, 0));
        assert_eq!(target.name, "c");
    }

    #[test]
    fn test_install_repoints_open_files() {
        let mut table = populated();
        let file = FileId(1);
        table.insert_file(file, 4, cap(0, 40));
        table.invalidate_rank(0);
        table.plan_migration();

        table.install_migrated(4, cap(1, 44));
        let open = table.file(file).unwrap();
        assert!(open.valid);
        assert_eq!(open.capability, cap(1, 44));
    }

    #[test]
    fn test_abandon_subtree_invalidates_descendants() {
        let mut table = populated();
        table.insert_file(FileId(1), 4, cap(0, 40));
        table.plan_migration();
        let before = table.invalidations.len();

        assert_eq!(table.abandon_subtree(3), 2);
        assert!(!table.inode(3).unwrap().valid);
        assert!(!table.inode(4).unwrap().valid);
        assert_eq!(table.invalidations.len(), before + 2);

        let summary = table.finish_migration();
        // Only a is still marked.
        assert_eq!(summary.migrated, 1);
        assert_eq!(summary.invalidated.len(), before + 2);
        assert!(table.invalidations.is_empty());
    }

    #[test]
    fn test_forget_removes_at_zero() {
        let mut table = populated();
        table.insert_inode(5, ROOT_INODE, "d", cap(0, 5));
        assert!(!table.forget_inode(5, 1));
        assert!(table.forget_inode(5, 1));
        assert!(table.inode(5).is_none());
    }

    #[test]
    fn test_held_guard_serializes_table_access() {
        let group = Arc::new(ServiceGroup::new("ionss", 0));
        let projection = Projection::new(1, "scratch", group, true, cap(0, 0), Arc::new(Quiet));

        assert!(projection.hold_caps());
        assert!(!projection.hold_caps());
        assert!(projection.try_lock_caps().is_none());

        projection.with_held(|table| table.set_root(cap(1, 0)));
        assert!(projection.release_caps());
        assert!(!projection.release_caps());
        assert_eq!(projection.root_capability(), cap(1, 0));
    }

    #[test]
    fn test_barrier_counts_down() {
        let group = Arc::new(ServiceGroup::new("ionss", 0));
        let projection = Projection::new(1, "scratch", group, true, cap(0, 0), Arc::new(Quiet));

        projection.arm_migration_barrier();
        projection.add_migration_ref();
        assert!(!projection.release_migration_ref());
        assert!(projection.release_migration_ref());
        assert_eq!(projection.migration_refs(), 0);

        // Arming adds a permit; outstanding ones are never discarded.
        projection.add_migration_ref();
        projection.arm_migration_barrier();
        assert_eq!(projection.migration_refs(), 2);
        assert!(!projection.release_migration_ref());
        assert!(projection.release_migration_ref());
    }

    #[test]
    fn test_state_transitions() {
        let group = Arc::new(ServiceGroup::new("ionss", 0));
        let projection = Projection::new(1, "scratch", group.clone(), true, cap(0, 0), Arc::new(Quiet));
        assert_eq!(projection.state().as_str(), "running");

        assert!(projection.begin_migration());
        assert_eq!(projection.state(), FailoverState::MigrationInProgress);
        assert!(matches!(projection.finish_migration(), MigrationExit::Completed(d) if d.is_empty()));
        assert_eq!(projection.state().as_str(), "complete");
        projection.settle();
        assert_eq!(projection.state(), FailoverState::Running);

        group.disable();
        projection.mark_offline(OfflineReason::HostDown);
        assert!(!projection.begin_migration());
        assert_eq!(projection.offline_reason(), Some(OfflineReason::HostDown));

        projection.set_online(true);
        assert_eq!(projection.state(), FailoverState::Running);
        assert!(group.is_enabled());
    }
}
