// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Transport Contract
//!
//! The forwarding core never touches wire bytes. It asks a [`Transport`] for
//! an outgoing RPC handle, fills the typed payload, addresses it to a rank
//! and hands it back together with a completion callback.
//!
//! A handle is consumed by `send`; resending a request always builds a new
//! handle from the request's own copy of the payload.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Port definition for the RPC fabric plus the payload and
//!   reply types that travel over it

use crate::domain::capability::{Capability, Rank};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inode number as seen by the client and the exported filesystem.
pub type InodeNum = u64;

/// RPC operations understood by a forwarding server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    /// Query the export list (initial mount and post-eviction re-registration)
    Register,
    Lookup,
    #[default]
    Getattr,
    Open,
    Close,
    Opendir,
    Closedir,
    Read,
    /// Re-issue a capability for an inode on a new rank
    Migrate,
}

/// Typed request fields carried in an RPC.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Capability the server resolves first (object, parent, or export root)
    pub capability: Capability,
    /// Entry name for lookup and migration
    pub name: String,
    /// Inode number the client expects the server to find
    pub inode: InodeNum,
    pub offset: u64,
    pub length: u32,
}

/// Stat-equivalent metadata returned with entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryAttr {
    pub ino: InodeNum,
    pub size: u64,
    pub is_dir: bool,
}

/// A new or migrated capability plus its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryReply {
    pub capability: Capability,
    pub attr: EntryAttr,
}

/// One exported filesystem as advertised by the primary service rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInfo {
    pub id: u32,
    pub name: String,
    pub root: Capability,
}

/// Server-side failure reported inside an otherwise successful RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    #[error("no such entry")]
    NoEntry,
    #[error("stale capability")]
    Stale,
    #[error("invalid capability")]
    Invalid,
    #[error("server out of memory")]
    NoMemory,
    #[error("server I/O failure")]
    Io,
}

/// Reply body of a completed RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    Exports(Vec<ExportInfo>),
    Entry(EntryReply),
    Attr(EntryAttr),
    /// Opaque read payload
    Data(Vec<u8>),
    Done,
    Failed(ServerStatus),
}

/// Transport-level outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("RPC timed out")]
    Timeout,

    #[error("Destination unreachable")]
    Unreachable,

    #[error("Local transport out of memory")]
    OutOfMemory,

    #[error("Remote endpoint out of memory")]
    RemoteOutOfMemory,

    #[error("Request refused by server backpressure")]
    Backpressure,

    #[error("Rank {0} has been evicted")]
    Evicted(Rank),

    #[error("Rank {0} is not a member of the group")]
    OutOfGroup(Rank),

    #[error("Transport failure: {0}")]
    Other(String),
}

impl TransportError {
    /// Errors that are worth resending to the same rank unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::Unreachable
                | TransportError::OutOfMemory
                | TransportError::RemoteOutOfMemory
                | TransportError::Backpressure
        )
    }

    /// Errors meaning the destination rank is gone for good.
    pub fn is_host_down(&self) -> bool {
        matches!(
            self,
            TransportError::Evicted(_) | TransportError::OutOfGroup(_)
        )
    }
}

/// One outgoing RPC. Consumed by [`Transport::send`].
#[derive(Debug, Clone)]
pub struct RpcHandle {
    opcode: Opcode,
    destination: Option<Rank>,
    payload: RequestPayload,
}

impl RpcHandle {
    pub fn new(opcode: Opcode, destination: Option<Rank>) -> Self {
        Self {
            opcode,
            destination,
            payload: RequestPayload::default(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn destination(&self) -> Option<Rank> {
        self.destination
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut RequestPayload {
        &mut self.payload
    }

    /// Only transports address handles; callers go through
    /// [`Transport::set_destination`].
    pub fn address(&mut self, rank: Rank) {
        self.destination = Some(rank);
    }

    pub fn into_parts(self) -> (Opcode, Option<Rank>, RequestPayload) {
        (self.opcode, self.destination, self.payload)
    }
}

/// Completion callback, invoked exactly once for every successful `send`.
pub type Completion = Box<dyn FnOnce(Result<RpcReply, TransportError>) + Send>;

/// RPC fabric used by the client side of the forwarder.
///
/// When `send` returns `Err` the completion has been dropped without being
/// invoked; the caller owns the cleanup.
pub trait Transport: Send + Sync {
    fn create_request(
        &self,
        opcode: Opcode,
        destination_hint: Option<Rank>,
    ) -> Result<RpcHandle, TransportError>;

    fn set_destination(&self, rpc: &mut RpcHandle, rank: Rank) -> Result<(), TransportError>;

    fn send(&self, rpc: RpcHandle, on_complete: Completion) -> Result<(), TransportError>;
}
