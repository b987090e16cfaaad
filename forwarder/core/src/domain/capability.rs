// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Capability - 128-bit server handle (GAH)
//!
//! A capability is the opaque token a client holds in place of a server-side
//! descriptor. It crosses the wire between independently built client and
//! server binaries, so the packed layout below is bit-exact.
//!
//! ## Wire Layout (16 bytes, little-endian words)
//! ```text
//! word 0 (bytes 0..8):   revision:48 | root:8    | base:8
//! word 1 (bytes 8..16):  version:8   | fid:24    | reserved:24 | checksum:8
//! ```
//! The checksum is CRC-8 (polynomial 0x07, init 0, MSB-first) over bytes
//! `0..15`, which covers every field except the checksum itself. `reserved`
//! is inside the checksummed span, so a non-zero `reserved` on a capability
//! that was sealed with zero fails validation as corrupt.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Value object shared by the capability store (server) and
//!   the client object records

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster rank of a forwarding server.
pub type Rank = u32;

/// Packed size of a capability on the wire.
pub const CAPABILITY_SIZE: usize = 16;

/// Largest value representable in the 48-bit `revision` field.
pub const MAX_REVISION: u64 = (1 << 48) - 1;

/// Number of slots addressable through the 24-bit `fid` field.
pub const FID_SPACE: usize = 1 << 24;

/// Largest rank that fits the 8-bit `root`/`base` fields.
pub const MAX_CAPABILITY_RANK: Rank = u8::MAX as Rank;

const REVISION_MASK: u64 = MAX_REVISION;
const FID_MASK: u64 = (1 << 24) - 1;
const RESERVED_MASK: u64 = (1 << 24) - 1;

/// Unpacked capability fields.
///
/// Field widths are enforced when packing: bits above a field's width are
/// discarded by [`Capability::to_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "[u8; CAPABILITY_SIZE]", into = "[u8; CAPABILITY_SIZE]")]
pub struct Capability {
    /// Per-slot reuse counter (48 bits)
    pub revision: u64,
    /// Rank that issued the capability and serves requests bearing it
    pub root: u8,
    /// Rank owning the first logical byte of the object
    pub base: u8,
    /// Protocol version the capability was minted under
    pub version: u8,
    /// Slot index in the issuing store (24 bits)
    pub fid: u32,
    /// Unused, zero on every issued capability (24 bits)
    pub reserved: u32,
    /// CRC-8 over the preceding 120 bits
    pub checksum: u8,
}

impl Capability {
    /// The all-zero capability. Never issued by a store.
    pub const NULL: Capability = Capability {
        revision: 0,
        root: 0,
        base: 0,
        version: 0,
        fid: 0,
        reserved: 0,
        checksum: 0,
    };

    pub fn is_null(&self) -> bool {
        self.to_bytes() == [0u8; CAPABILITY_SIZE]
    }

    /// Pack into the 16-byte wire representation.
    pub fn to_bytes(&self) -> [u8; CAPABILITY_SIZE] {
        let word0 = (self.revision & REVISION_MASK)
            | (u64::from(self.root) << 48)
            | (u64::from(self.base) << 56);
        let word1 = u64::from(self.version)
            | ((u64::from(self.fid) & FID_MASK) << 8)
            | ((u64::from(self.reserved) & RESERVED_MASK) << 32)
            | (u64::from(self.checksum) << 56);

        let mut bytes = [0u8; CAPABILITY_SIZE];
        bytes[..8].copy_from_slice(&word0.to_le_bytes());
        bytes[8..].copy_from_slice(&word1.to_le_bytes());
        bytes
    }

    /// Unpack from the wire. Performs no validation.
    pub fn from_bytes(bytes: [u8; CAPABILITY_SIZE]) -> Self {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        let word0 = u64::from_le_bytes(word);
        word.copy_from_slice(&bytes[8..]);
        let word1 = u64::from_le_bytes(word);

        Self {
            revision: word0 & REVISION_MASK,
            root: (word0 >> 48) as u8,
            base: (word0 >> 56) as u8,
            version: word1 as u8,
            fid: ((word1 >> 8) & FID_MASK) as u32,
            reserved: ((word1 >> 32) & RESERVED_MASK) as u32,
            checksum: (word1 >> 56) as u8,
        }
    }

    /// Checksum the capability should carry given its other fields.
    pub fn compute_checksum(&self) -> u8 {
        crc8(&self.to_bytes()[..CAPABILITY_SIZE - 1])
    }

    /// Return a copy with the checksum recomputed.
    pub fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    pub fn checksum_matches(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    /// Rank requests bearing this capability are addressed to.
    pub fn root_rank(&self) -> Rank {
        Rank::from(self.root)
    }
}

impl From<[u8; CAPABILITY_SIZE]> for Capability {
    fn from(bytes: [u8; CAPABILITY_SIZE]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Capability> for [u8; CAPABILITY_SIZE] {
    fn from(capability: Capability) -> Self {
        capability.to_bytes()
    }
}

impl fmt::Display for Capability {
    /// `root.base.fid.revision` followed by the version and checksum.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{} v{} crc={:#04x}",
            self.root, self.base, self.fid, self.revision, self.version, self.checksum
        )
    }
}

/// CRC-8 with polynomial 0x07, zero init, processed MSB-first.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Capability {
        Capability {
            revision: 0x0000_1234_5678_9abc,
            root: 3,
            base: 7,
            version: 1,
            fid: 0x00ab_cdef,
            reserved: 0,
            checksum: 0,
        }
        .sealed()
    }

    #[test]
    fn test_crc8_check_value() {
        // Standard CRC-8/SMBUS check value for "123456789"
        assert_eq!(crc8(b"123456789"), 0xf4);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn test_packed_layout() {
        let cap = sample();
        let bytes = cap.to_bytes();

        // revision occupies the low 48 bits of word 0
        assert_eq!(&bytes[..6], &[0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(bytes[6], 3, "root");
        assert_eq!(bytes[7], 7, "base");
        assert_eq!(bytes[8], 1, "version");
        assert_eq!(&bytes[9..12], &[0xef, 0xcd, 0xab], "fid");
        assert_eq!(&bytes[12..15], &[0, 0, 0], "reserved");
        assert_eq!(bytes[15], crc8(&bytes[..15]));
    }

    #[test]
    fn test_unpack_restores_fields() {
        let cap = sample();
        assert_eq!(Capability::from_bytes(cap.to_bytes()), cap);
        assert!(cap.checksum_matches());
    }

    #[test]
    fn test_oversized_fields_are_truncated() {
        let cap = Capability {
            revision: u64::MAX,
            fid: u32::MAX,
            reserved: u32::MAX,
            ..Capability::NULL
        };
        let unpacked = Capability::from_bytes(cap.to_bytes());
        assert_eq!(unpacked.revision, MAX_REVISION);
        assert_eq!(unpacked.fid, (FID_SPACE - 1) as u32);
        assert_eq!(unpacked.reserved, 0x00ff_ffff);
    }

    #[test]
    fn test_reserved_is_checksummed() {
        let mut cap = sample();
        cap.reserved = 1;
        assert!(!cap.checksum_matches());
    }

    #[test]
    fn test_bincode_encodes_sixteen_raw_bytes() {
        let cap = sample();
        let encoded = bincode::serialize(&cap).unwrap();
        assert_eq!(encoded, cap.to_bytes().to_vec());

        let decoded: Capability = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, cap);
    }

    #[test]
    fn test_null() {
        assert!(Capability::NULL.is_null());
        assert!(!sample().is_null());
    }
}
