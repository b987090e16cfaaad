// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory exported filesystem
//!
//! A directory tree held in a map, shared by every forwarding server of a
//! loopback cluster. Inode 1 is the root directory.

use crate::domain::namespace::{Namespace, NamespaceError};
use crate::domain::projection::ROOT_INODE;
use crate::domain::transport::{EntryAttr, InodeNum};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug)]
enum NodeKind {
    Directory(BTreeMap<String, InodeNum>),
    File(Vec<u8>),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
}

impl Node {
    fn attr(&self, ino: InodeNum) -> EntryAttr {
        match &self.kind {
            NodeKind::Directory(entries) => EntryAttr {
                ino,
                size: entries.len() as u64,
                is_dir: true,
            },
            NodeKind::File(data) => EntryAttr {
                ino,
                size: data.len() as u64,
                is_dir: false,
            },
        }
    }
}

#[derive(Debug)]
pub struct InMemoryNamespace {
    nodes: RwLock<HashMap<InodeNum, Node>>,
    next_ino: AtomicU64,
}

impl InMemoryNamespace {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                kind: NodeKind::Directory(BTreeMap::new()),
            },
        );
        Self {
            nodes: RwLock::new(nodes),
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    pub fn mkdir(&self, parent: InodeNum, name: &str) -> Result<InodeNum, NamespaceError> {
        self.link(parent, name, NodeKind::Directory(BTreeMap::new()))
    }

    pub fn create_file(
        &self,
        parent: InodeNum,
        name: &str,
        data: Vec<u8>,
    ) -> Result<InodeNum, NamespaceError> {
        self.link(parent, name, NodeKind::File(data))
    }

    /// Remove `name` from `parent`. Directories must be empty.
    pub fn unlink(&self, parent: InodeNum, name: &str) -> Result<InodeNum, NamespaceError> {
        let mut nodes = self.nodes.write();
        let ino = match nodes.get(&parent).map(|node| &node.kind) {
            Some(NodeKind::Directory(entries)) => {
                *entries.get(name).ok_or(NamespaceError::NotFound)?
            }
            Some(NodeKind::File(_)) => return Err(NamespaceError::NotADirectory(parent)),
            None => return Err(NamespaceError::NotFound),
        };

        if let Some(Node {
            kind: NodeKind::Directory(entries),
        }) = nodes.get(&ino)
        {
            if !entries.is_empty() {
                return Err(NamespaceError::Io(format!("directory {} not empty", name)));
            }
        }

        if let Some(Node {
            kind: NodeKind::Directory(entries),
        }) = nodes.get_mut(&parent)
        {
            entries.remove(name);
        }
        nodes.remove(&ino);
        Ok(ino)
    }

    /// Inodes in the tree, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    fn link(&self, parent: InodeNum, name: &str, kind: NodeKind) -> Result<InodeNum, NamespaceError> {
        if name.is_empty() || name.contains('/') {
            return Err(NamespaceError::Io(format!("invalid name {:?}", name)));
        }

        let mut nodes = self.nodes.write();
        let entries = match nodes.get_mut(&parent).map(|node| &mut node.kind) {
            Some(NodeKind::Directory(entries)) => entries,
            Some(NodeKind::File(_)) => return Err(NamespaceError::NotADirectory(parent)),
            None => return Err(NamespaceError::NotFound),
        };
        if entries.contains_key(name) {
            return Err(NamespaceError::Exists(name.to_string()));
        }

        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        entries.insert(name.to_string(), ino);
        nodes.insert(ino, Node { kind });
        Ok(ino)
    }
}

impl Default for InMemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace for InMemoryNamespace {
    fn lookup(&self, parent: InodeNum, name: &str) -> Result<EntryAttr, NamespaceError> {
        let nodes = self.nodes.read();
        let ino = match nodes.get(&parent).map(|node| &node.kind) {
            Some(NodeKind::Directory(entries)) => {
                *entries.get(name).ok_or(NamespaceError::NotFound)?
            }
            Some(NodeKind::File(_)) => return Err(NamespaceError::NotADirectory(parent)),
            None => return Err(NamespaceError::NotFound),
        };
        nodes
            .get(&ino)
            .map(|node| node.attr(ino))
            .ok_or(NamespaceError::NotFound)
    }

    fn getattr(&self, ino: InodeNum) -> Result<EntryAttr, NamespaceError> {
        self.nodes
            .read()
            .get(&ino)
            .map(|node| node.attr(ino))
            .ok_or(NamespaceError::NotFound)
    }

    fn read(&self, ino: InodeNum, offset: u64, length: u32) -> Result<Vec<u8>, NamespaceError> {
        let nodes = self.nodes.read();
        match nodes.get(&ino).map(|node| &node.kind) {
            Some(NodeKind::File(data)) => {
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(length as usize).min(data.len());
                Ok(data[start..end].to_vec())
            }
            Some(NodeKind::Directory(_)) => Err(NamespaceError::IsADirectory(ino)),
            None => Err(NamespaceError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_operations() {
        let ns = InMemoryNamespace::new();
        let dir = ns.mkdir(ROOT_INODE, "d").unwrap();
        let file = ns.create_file(dir, "f", b"0123456789".to_vec()).unwrap();

        assert_eq!(ns.lookup(ROOT_INODE, "d").unwrap().ino, dir);
        assert!(ns.getattr(dir).unwrap().is_dir);
        assert_eq!(ns.lookup(dir, "f").unwrap().size, 10);
        assert_eq!(ns.read(file, 8, 100).unwrap(), b"89".to_vec());
        assert_eq!(ns.read(file, 20, 4).unwrap(), Vec::<u8>::new());

        assert_eq!(ns.mkdir(ROOT_INODE, "d"), Err(NamespaceError::Exists("d".to_string())));
        assert_eq!(ns.mkdir(file, "x"), Err(NamespaceError::NotADirectory(file)));
        assert_eq!(ns.read(dir, 0, 1), Err(NamespaceError::IsADirectory(dir)));
    }

    #[test]
    fn test_unlink() {
        let ns = InMemoryNamespace::new();
        let dir = ns.mkdir(ROOT_INODE, "d").unwrap();
        ns.create_file(dir, "f", Vec::new()).unwrap();

        assert!(ns.unlink(ROOT_INODE, "d").is_err());
        ns.unlink(dir, "f").unwrap();
        assert_eq!(ns.lookup(dir, "f"), Err(NamespaceError::NotFound));
        assert_eq!(ns.unlink(ROOT_INODE, "d").unwrap(), dir);
        assert_eq!(ns.node_count(), 1);
    }
}
