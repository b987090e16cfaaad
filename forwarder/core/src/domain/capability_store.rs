// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capability Store
//!
//! Server-side table of issued capabilities for a single rank. Each slot is
//! addressed by the capability's `fid`; a capability is live only while its
//! slot is in use and carries the slot's current revision.
//!
//! Slots live in fixed-size blocks that are only ever appended, so growing
//! the table never moves a slot that an outstanding capability refers to.
//! Free slots are recycled in FIFO order: a freed slot joins the tail of the
//! free list and allocation pops from the head. This spreads revision
//! increments across the whole table.
//!
//! `destroy` keeps the highest revision it has seen as a floor for slots
//! added later, so a capability issued before the teardown never matches a
//! slot of a rebuilt table.
//!
//! The store never logs and never retries. Callers that share it across
//! threads wrap it in their own lock (see `ForwardingServer`).
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Allocation, validation and recycling of capabilities

use crate::domain::capability::{Capability, Rank, FID_SPACE, MAX_CAPABILITY_RANK, MAX_REVISION};
use std::collections::VecDeque;
use thiserror::Error;

/// Protocol version stamped into capabilities by default.
pub const DEFAULT_CAPABILITY_VERSION: u8 = 1;

/// Slots appended each time the free list runs dry.
pub const DEFAULT_GROWTH_DELTA: usize = 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("Null or malformed capability argument")]
    InvalidArgument,

    #[error("Capability checksum mismatch: stored {stored:#04x}, computed {computed:#04x}")]
    Corrupt { stored: u8, computed: u8 },

    #[error("Capability version mismatch: store is v{expected}, capability is v{found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Capability fid {fid} is outside the table (capacity {capacity})")]
    Overflow { fid: u32, capacity: usize },

    #[error("Capability does not refer to a live slot")]
    NotFound,

    #[error("Capability store still has {live} live slots")]
    Busy { live: usize },

    #[error("Capability table could not grow")]
    OutOfMemory,
}

#[derive(Debug)]
struct Slot<T> {
    in_use: bool,
    revision: u64,
    owner: Option<T>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            in_use: false,
            revision: 0,
            owner: None,
        }
    }
}

/// Capability table for one server rank.
///
/// `T` is whatever the caller wants back from a lookup: an object id, an
/// index into another arena, a small enum.
#[derive(Debug)]
pub struct CapabilityStore<T> {
    rank: u8,
    version: u8,
    delta: usize,
    blocks: Vec<Vec<Slot<T>>>,
    free: VecDeque<u32>,
    live: usize,
    /// Starting revision of newly grown slots
    revision_floor: u64,
}

impl<T> CapabilityStore<T> {
    /// Create an empty store for `rank` with the default version and growth.
    pub fn new(rank: Rank) -> Result<Self, CapabilityError> {
        Self::with_settings(rank, DEFAULT_CAPABILITY_VERSION, DEFAULT_GROWTH_DELTA)
    }

    pub fn with_settings(rank: Rank, version: u8, delta: usize) -> Result<Self, CapabilityError> {
        if rank > MAX_CAPABILITY_RANK || version == 0 || delta == 0 || delta > FID_SPACE {
            return Err(CapabilityError::InvalidArgument);
        }

        Ok(Self {
            rank: rank as u8,
            version,
            delta,
            blocks: Vec::new(),
            free: VecDeque::new(),
            live: 0,
            revision_floor: 0,
        })
    }

    pub fn rank(&self) -> Rank {
        Rank::from(self.rank)
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Number of slots currently addressable.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.delta
    }

    /// Number of slots currently in use.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Issue a capability for `owner`.
    ///
    /// The table grows by one block if no slot is free. The only failure is
    /// being unable to grow.
    pub fn allocate(&mut self, base: Rank, owner: T) -> Result<Capability, CapabilityError> {
        if base > MAX_CAPABILITY_RANK {
            return Err(CapabilityError::InvalidArgument);
        }
        if self.free.is_empty() {
            self.grow()?;
        }
        let fid = self.free.pop_front().ok_or(CapabilityError::OutOfMemory)?;

        let (block, index) = self.position(fid);
        let slot = &mut self.blocks[block][index];
        slot.revision += 1;
        slot.in_use = true;
        slot.owner = Some(owner);
        self.live += 1;

        Ok(Capability {
            revision: slot.revision,
            root: self.rank,
            base: base as u8,
            version: self.version,
            fid,
            reserved: 0,
            checksum: 0,
        }
        .sealed())
    }

    /// Release the slot behind `capability` and hand back its owner.
    pub fn deallocate(&mut self, capability: &Capability) -> Result<T, CapabilityError> {
        let fid = self.validate(capability)?;

        let (block, index) = self.position(fid);
        let slot = &mut self.blocks[block][index];
        slot.in_use = false;
        let owner = slot.owner.take().ok_or(CapabilityError::NotFound)?;
        self.live -= 1;

        // A slot whose revision cannot advance any further is retired.
        if slot.revision < MAX_REVISION {
            self.free.push_back(fid);
        }

        Ok(owner)
    }

    /// Resolve a live capability to its owner without changing anything.
    pub fn lookup(&self, capability: &Capability) -> Result<&T, CapabilityError> {
        let fid = self.validate(capability)?;
        let (block, index) = self.position(fid);
        self.blocks[block][index]
            .owner
            .as_ref()
            .ok_or(CapabilityError::NotFound)
    }

    /// Free all table storage. Refused while any slot is in use.
    pub fn destroy(&mut self) -> Result<(), CapabilityError> {
        if self.live > 0 {
            return Err(CapabilityError::Busy { live: self.live });
        }
        self.revision_floor = self
            .blocks
            .iter()
            .flatten()
            .map(|slot| slot.revision)
            .fold(self.revision_floor, u64::max);
        self.blocks = Vec::new();
        self.free = VecDeque::new();
        Ok(())
    }

    /// Validation chain shared by lookup and deallocate.
    ///
    /// The ordering matters: `fid` is only trusted once the checksum and
    /// version have passed.
    fn validate(&self, capability: &Capability) -> Result<u32, CapabilityError> {
        if capability.is_null() {
            return Err(CapabilityError::InvalidArgument);
        }

        let computed = capability.compute_checksum();
        if capability.checksum != computed {
            return Err(CapabilityError::Corrupt {
                stored: capability.checksum,
                computed,
            });
        }

        if capability.version != self.version {
            return Err(CapabilityError::VersionMismatch {
                expected: self.version,
                found: capability.version,
            });
        }

        let capacity = self.capacity();
        if capability.fid as usize >= capacity {
            return Err(CapabilityError::Overflow {
                fid: capability.fid,
                capacity,
            });
        }

        let (block, index) = self.position(capability.fid);
        let slot = &self.blocks[block][index];
        if !slot.in_use || slot.revision != capability.revision {
            return Err(CapabilityError::NotFound);
        }

        Ok(capability.fid)
    }

    fn grow(&mut self) -> Result<(), CapabilityError> {
        let start = self.capacity();
        let end = start + self.delta;
        if end > FID_SPACE || self.revision_floor >= MAX_REVISION {
            return Err(CapabilityError::OutOfMemory);
        }

        let mut block: Vec<Slot<T>> = Vec::new();
        block
            .try_reserve_exact(self.delta)
            .map_err(|_| CapabilityError::OutOfMemory)?;
        let floor = self.revision_floor;
        block.resize_with(self.delta, || Slot {
            revision: floor,
            ..Slot::default()
        });

        self.blocks
            .try_reserve(1)
            .map_err(|_| CapabilityError::OutOfMemory)?;
        self.free
            .try_reserve(self.delta)
            .map_err(|_| CapabilityError::OutOfMemory)?;

        self.blocks.push(block);
        self.free.extend(start as u32..end as u32);
        Ok(())
    }

    fn position(&self, fid: u32) -> (usize, usize) {
        let fid = fid as usize;
        (fid / self.delta, fid % self.delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(delta: usize) -> CapabilityStore<u64> {
        CapabilityStore::with_settings(2, DEFAULT_CAPABILITY_VERSION, delta).unwrap()
    }

    #[test]
    fn test_allocate_fills_fields() {
        let mut store = store(8);
        let cap = store.allocate(3, 42).unwrap();

        assert_eq!(cap.root, 2);
        assert_eq!(cap.base, 3);
        assert_eq!(cap.version, DEFAULT_CAPABILITY_VERSION);
        assert_eq!(cap.revision, 1);
        assert_eq!(cap.reserved, 0);
        assert!(cap.checksum_matches());
        assert_eq!(store.live(), 1);
        assert_eq!(store.capacity(), 8);
    }

    #[test]
    fn test_lookup_returns_owner_until_deallocated() {
        let mut store = store(8);
        let caps: Vec<_> = (0..5).map(|i| store.allocate(0, i * 10).unwrap()).collect();

        for (i, cap) in caps.iter().enumerate() {
            assert_eq!(*store.lookup(cap).unwrap(), i as u64 * 10);
        }

        assert_eq!(store.deallocate(&caps[2]).unwrap(), 20);
        assert_eq!(store.lookup(&caps[2]), Err(CapabilityError::NotFound));
        assert_eq!(store.deallocate(&caps[2]), Err(CapabilityError::NotFound));
        assert_eq!(*store.lookup(&caps[3]).unwrap(), 30);
    }

    #[test]
    fn test_reuse_bumps_revision() {
        // One slot forces reuse of the same fid.
        let mut store = store(1);
        let first = store.allocate(0, 1).unwrap();
        store.deallocate(&first).unwrap();
        let second = store.allocate(0, 2).unwrap();

        assert_eq!(first.fid, second.fid);
        assert!(second.revision > first.revision);
        assert_eq!(store.lookup(&first), Err(CapabilityError::NotFound));
        assert_eq!(*store.lookup(&second).unwrap(), 2);
    }

    #[test]
    fn test_free_list_is_fifo() {
        let mut store = store(4);
        let caps: Vec<_> = (0..4).map(|i| store.allocate(0, i).unwrap()).collect();
        store.deallocate(&caps[1]).unwrap();
        store.deallocate(&caps[3]).unwrap();

        // Freed slots come back in the order they were freed.
        assert_eq!(store.allocate(0, 10).unwrap().fid, caps[1].fid);
        assert_eq!(store.allocate(0, 11).unwrap().fid, caps[3].fid);
    }

    #[test]
    fn test_growth_keeps_existing_capabilities() {
        let mut store = store(4);
        let caps: Vec<_> = (0..37).map(|i| store.allocate(1, i).unwrap()).collect();

        assert_eq!(store.capacity(), 40);
        for (i, cap) in caps.iter().enumerate() {
            assert_eq!(*store.lookup(cap).unwrap(), i as u64);
        }
    }

    #[test]
    fn test_null_is_invalid_argument() {
        let store = store(4);
        assert_eq!(
            store.lookup(&Capability::NULL),
            Err(CapabilityError::InvalidArgument)
        );
    }

    #[test]
    fn test_validation_order_checksum_before_fid() {
        let mut store = store(4);
        let mut cap = store.allocate(0, 1).unwrap();

        // Garbage fid with a stale checksum must report Corrupt, not Overflow.
        cap.fid = 0x00ff_ffff;
        assert!(matches!(
            store.lookup(&cap),
            Err(CapabilityError::Corrupt { .. })
        ));

        // Same fid resealed reaches the capacity check.
        let cap = cap.sealed();
        assert_eq!(
            store.lookup(&cap),
            Err(CapabilityError::Overflow {
                fid: 0x00ff_ffff,
                capacity: 4
            })
        );
    }

    #[test]
    fn test_version_mismatch() {
        let mut store = store(4);
        let mut cap = store.allocate(0, 1).unwrap();
        cap.version = DEFAULT_CAPABILITY_VERSION + 1;
        let cap = cap.sealed();

        assert_eq!(
            store.deallocate(&cap),
            Err(CapabilityError::VersionMismatch {
                expected: DEFAULT_CAPABILITY_VERSION,
                found: DEFAULT_CAPABILITY_VERSION + 1
            })
        );
        assert_eq!(store.live(), 1);
    }

    #[test]
    fn test_stale_revision_is_not_found() {
        let mut store = store(4);
        let mut cap = store.allocate(0, 1).unwrap();
        cap.revision += 1;
        assert_eq!(store.lookup(&cap.sealed()), Err(CapabilityError::NotFound));
    }

    #[test]
    fn test_reserved_corruption_is_detected() {
        let mut store = store(4);
        let mut cap = store.allocate(3, 7).unwrap();
        cap.reserved = 0x0000_0100;

        assert!(matches!(
            store.lookup(&cap),
            Err(CapabilityError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let mut store = store(4);
        let cap = store.allocate(3, 7).unwrap();
        let bytes = cap.to_bytes();

        for bit in 0..128 {
            let mut flipped = bytes;
            flipped[bit / 8] ^= 1 << (bit % 8);
            let corrupted = Capability::from_bytes(flipped);
            assert!(
                matches!(store.lookup(&corrupted), Err(CapabilityError::Corrupt { .. })),
                "bit {} flip was accepted",
                bit
            );
        }
    }

    #[test]
    fn test_destroy_requires_empty_table() {
        let mut store = store(4);
        let a = store.allocate(0, 1).unwrap();
        let b = store.allocate(0, 2).unwrap();

        assert_eq!(store.destroy(), Err(CapabilityError::Busy { live: 2 }));

        store.deallocate(&a).unwrap();
        store.deallocate(&b).unwrap();
        assert!(store.destroy().is_ok());
        assert_eq!(store.capacity(), 0);
    }

    #[test]
    fn test_capability_from_before_destroy_stays_dead() {
        let mut store = store(4);
        let old = store.allocate(0, 1).unwrap();
        store.deallocate(&old).unwrap();
        let reused = store.allocate(0, 2).unwrap();
        store.deallocate(&reused).unwrap();
        store.destroy().unwrap();

        // The rebuilt table hands out fid 0 again, with a newer revision.
        let fresh = store.allocate(0, 3).unwrap();
        assert_eq!(fresh.fid, old.fid);
        assert!(fresh.revision > reused.revision);
        assert_eq!(store.lookup(&old), Err(CapabilityError::NotFound));
        assert_eq!(store.lookup(&reused), Err(CapabilityError::NotFound));
        assert_eq!(store.lookup(&fresh), Ok(&3));
    }

    #[test]
    fn test_rejects_unrepresentable_rank() {
        assert!(CapabilityStore::<u64>::new(256).is_err());
        let mut store = store(4);
        assert_eq!(store.allocate(300, 1), Err(CapabilityError::InvalidArgument));
    }
}
