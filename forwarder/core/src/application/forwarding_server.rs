// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Forwarding Server
//!
//! Server half of the forwarder for one rank. Every handle given to a client
//! is a capability minted by this rank's [`CapabilityStore`]; every incoming
//! capability is validated against the same store before it is trusted.
//!
//! Inodes get one shared capability each, reused by every lookup and
//! migration that resolves to the same inode number. Open files and
//! directories get a capability per open.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Server-side RPC handlers over a capability store

use crate::domain::capability::{Capability, Rank};
use crate::domain::capability_store::{CapabilityError, CapabilityStore};
use crate::domain::forwarder_config::CapabilityConfig;
use crate::domain::namespace::{Namespace, NamespaceError};
use crate::domain::transport::{
    EntryReply, ExportInfo, InodeNum, Opcode, RequestPayload, RpcReply, ServerStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a server-issued capability stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerObject {
    Inode(InodeNum),
    File(InodeNum),
    Dir(InodeNum),
}

/// An export to advertise at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSpec {
    pub name: String,
    pub root: InodeNum,
}

impl ExportSpec {
    pub fn new(name: impl Into<String>, root: InodeNum) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }
}

#[derive(Debug, Clone)]
struct Export {
    id: u32,
    name: String,
    root: Capability,
}

pub struct ForwardingServer {
    rank: Rank,
    namespace: Arc<dyn Namespace>,
    store: RwLock<CapabilityStore<ServerObject>>,
    exports: Vec<Export>,
    /// Shared per-inode capabilities. Lock order: before `store`.
    inode_handles: Mutex<HashMap<InodeNum, Capability>>,
}

impl ForwardingServer {
    pub fn new(
        rank: Rank,
        config: &CapabilityConfig,
        namespace: Arc<dyn Namespace>,
        exports: Vec<ExportSpec>,
    ) -> Result<Self, CapabilityError> {
        let store = CapabilityStore::with_settings(rank, config.version, config.growth_delta)?;
        let server = Self {
            rank,
            namespace,
            store: RwLock::new(store),
            exports: Vec::new(),
            inode_handles: Mutex::new(HashMap::new()),
        };

        let mut advertised = Vec::with_capacity(exports.len());
        for (id, export) in exports.into_iter().enumerate() {
            let root = server.inode_capability(export.root)?;
            debug!("Rank {} exports {} with root {}", rank, export.name, root);
            advertised.push(Export {
                id: id as u32,
                name: export.name,
                root,
            });
        }

        Ok(Self {
            exports: advertised,
            ..server
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Capabilities currently live in this rank's store.
    pub fn live_capabilities(&self) -> usize {
        self.store.read().live()
    }

    /// Dispatch one decoded RPC.
    pub fn handle(&self, opcode: Opcode, payload: &RequestPayload) -> RpcReply {
        let result = match opcode {
            Opcode::Register => Ok(self.register()),
            Opcode::Lookup => self.lookup(payload),
            Opcode::Getattr => self.getattr(payload),
            Opcode::Open => self.open(payload),
            Opcode::Opendir => self.opendir(payload),
            Opcode::Close => self.close(payload, false),
            Opcode::Closedir => self.close(payload, true),
            Opcode::Read => self.read(payload),
            Opcode::Migrate => self.migrate(payload),
        };
        result.unwrap_or_else(RpcReply::Failed)
    }

    fn register(&self) -> RpcReply {
        RpcReply::Exports(
            self.exports
                .iter()
                .map(|export| ExportInfo {
                    id: export.id,
                    name: export.name.clone(),
                    root: export.root,
                })
                .collect(),
        )
    }

    fn lookup(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        let parent = self.resolve_inode(&payload.capability)?;
        let attr = self
            .namespace
            .lookup(parent, &payload.name)
            .map_err(namespace_status)?;
        let capability = self.inode_capability(attr.ino).map_err(store_status)?;
        Ok(RpcReply::Entry(EntryReply { capability, attr }))
    }

    fn getattr(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        let ino = match self.resolve(&payload.capability)? {
            ServerObject::Inode(ino) | ServerObject::File(ino) | ServerObject::Dir(ino) => ino,
        };
        let attr = self.namespace.getattr(ino).map_err(namespace_status)?;
        Ok(RpcReply::Attr(attr))
    }

    fn open(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        let ino = self.resolve_inode(&payload.capability)?;
        let attr = self.namespace.getattr(ino).map_err(namespace_status)?;
        if attr.is_dir {
            return Err(ServerStatus::Invalid);
        }
        let capability = self
            .store
            .write()
            .allocate(self.rank, ServerObject::File(ino))
            .map_err(store_status)?;
        Ok(RpcReply::Entry(EntryReply { capability, attr }))
    }

    fn opendir(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        let ino = self.resolve_inode(&payload.capability)?;
        let attr = self.namespace.getattr(ino).map_err(namespace_status)?;
        if !attr.is_dir {
            return Err(ServerStatus::Invalid);
        }
        let capability = self
            .store
            .write()
            .allocate(self.rank, ServerObject::Dir(ino))
            .map_err(store_status)?;
        Ok(RpcReply::Entry(EntryReply { capability, attr }))
    }

    fn close(&self, payload: &RequestPayload, directory: bool) -> Result<RpcReply, ServerStatus> {
        let object = self.resolve(&payload.capability)?;
        match (object, directory) {
            (ServerObject::File(_), false) | (ServerObject::Dir(_), true) => {}
            // Shared inode handles stay with the server.
            (ServerObject::Inode(_), _) => return Ok(RpcReply::Done),
            _ => return Err(ServerStatus::Invalid),
        }
        self.store
            .write()
            .deallocate(&payload.capability)
            .map_err(store_status)?;
        Ok(RpcReply::Done)
    }

    fn read(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        // Open files re-pointed by a migration carry the inode capability.
        let ino = match self.resolve(&payload.capability)? {
            ServerObject::File(ino) | ServerObject::Inode(ino) => ino,
            ServerObject::Dir(_) => return Err(ServerStatus::Invalid),
        };
        let data = self
            .namespace
            .read(ino, payload.offset, payload.length)
            .map_err(namespace_status)?;
        Ok(RpcReply::Data(data))
    }

    /// Re-issue a capability on this rank for an inode a client held on an
    /// evicted one.
    ///
    /// `payload.capability` is the parent (or export root) capability,
    /// `payload.name` the entry name under it and `payload.inode` the inode
    /// number the client expects to find there.
    fn migrate(&self, payload: &RequestPayload) -> Result<RpcReply, ServerStatus> {
        let parent = self.resolve_inode(&payload.capability)?;
        if payload.name.is_empty() {
            return Err(ServerStatus::NoEntry);
        }

        let existing = self.inode_handles.lock().get(&payload.inode).copied();
        if let Some(capability) = existing {
            let attr = self
                .namespace
                .getattr(payload.inode)
                .map_err(namespace_status)?;
            debug!("Migrate reuses handle {} for inode {}", capability, payload.inode);
            return Ok(RpcReply::Entry(EntryReply { capability, attr }));
        }

        let attr = self
            .namespace
            .lookup(parent, &payload.name)
            .map_err(namespace_status)?;
        if attr.ino != payload.inode {
            info!(
                "Migrate of {} under {} found inode {}, expected {}",
                payload.name, parent, attr.ino, payload.inode
            );
            return Err(ServerStatus::NoEntry);
        }

        let capability = self.inode_capability(attr.ino).map_err(store_status)?;
        Ok(RpcReply::Entry(EntryReply { capability, attr }))
    }

    /// Release this rank's inode handles and free the table.
    ///
    /// Fails with `Busy` while clients still hold open files or directories,
    /// leaving every handle in place.
    pub fn shutdown(&self) -> Result<(), CapabilityError> {
        let mut handles = self.inode_handles.lock();
        let mut store = self.store.write();
        let open = store.live().saturating_sub(handles.len());
        if open > 0 {
            return Err(CapabilityError::Busy { live: open });
        }
        for (ino, capability) in handles.drain() {
            if let Err(e) = store.deallocate(&capability) {
                warn!("Inode {} handle {} already gone: {}", ino, capability, e);
            }
        }
        store.destroy()
    }

    fn inode_capability(&self, ino: InodeNum) -> Result<Capability, CapabilityError> {
        let mut handles = self.inode_handles.lock();
        if let Some(capability) = handles.get(&ino) {
            return Ok(*capability);
        }
        let capability = self
            .store
            .write()
            .allocate(self.rank, ServerObject::Inode(ino))?;
        handles.insert(ino, capability);
        Ok(capability)
    }

    fn resolve(&self, capability: &Capability) -> Result<ServerObject, ServerStatus> {
        if capability.is_null() {
            return Err(ServerStatus::Invalid);
        }
        // A capability minted by another rank can never be in this table.
        if capability.root_rank() != self.rank {
            return Err(ServerStatus::Stale);
        }
        self.store
            .read()
            .lookup(capability)
            .copied()
            .map_err(store_status)
    }

    fn resolve_inode(&self, capability: &Capability) -> Result<InodeNum, ServerStatus> {
        match self.resolve(capability)? {
            ServerObject::Inode(ino) => Ok(ino),
            _ => Err(ServerStatus::Invalid),
        }
    }
}

impl std::fmt::Debug for ForwardingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingServer")
            .field("rank", &self.rank)
            .field("exports", &self.exports.len())
            .field("live", &self.live_capabilities())
            .finish()
    }
}

fn store_status(err: CapabilityError) -> ServerStatus {
    match err {
        CapabilityError::NotFound => ServerStatus::Stale,
        CapabilityError::OutOfMemory => ServerStatus::NoMemory,
        CapabilityError::Busy { .. } => ServerStatus::Io,
        CapabilityError::InvalidArgument
        | CapabilityError::Corrupt { .. }
        | CapabilityError::VersionMismatch { .. }
        | CapabilityError::Overflow { .. } => ServerStatus::Invalid,
    }
}

fn namespace_status(err: NamespaceError) -> ServerStatus {
    match err {
        NamespaceError::NotFound => ServerStatus::NoEntry,
        NamespaceError::NotADirectory(_) | NamespaceError::IsADirectory(_) => ServerStatus::Invalid,
        NamespaceError::Exists(_) | NamespaceError::Io(_) => ServerStatus::Io,
    }
}
