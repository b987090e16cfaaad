// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Exported filesystem as seen by a forwarding server.

use crate::domain::transport::{EntryAttr, InodeNum};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamespaceError {
    #[error("No such entry")]
    NotFound,

    #[error("Inode {0} is not a directory")]
    NotADirectory(InodeNum),

    #[error("Inode {0} is a directory")]
    IsADirectory(InodeNum),

    #[error("Entry {0} already exists")]
    Exists(String),

    #[error("Namespace I/O error: {0}")]
    Io(String),
}

/// Backing store a forwarding server resolves names and data against.
///
/// Every rank of a group serves the same namespace, so inode numbers are
/// stable across ranks.
pub trait Namespace: Send + Sync {
    fn lookup(&self, parent: InodeNum, name: &str) -> Result<EntryAttr, NamespaceError>;

    fn getattr(&self, ino: InodeNum) -> Result<EntryAttr, NamespaceError>;

    fn read(&self, ino: InodeNum, offset: u64, length: u32) -> Result<Vec<u8>, NamespaceError>;
}
