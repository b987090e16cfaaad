// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Loopback Fabric
//!
//! In-process stand-in for the cluster RPC layer. Sent RPCs are encoded with
//! `bincode`, queued, and only delivered when the owner drives progress, so
//! tests choose the exact interleaving of completions. Delivery decodes the
//! payload, runs the destination rank's [`ForwardingServer`] and decodes the
//! encoded reply before calling the completion.
//!
//! Completions always run with no fabric lock held; they are free to send
//! more RPCs.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** `Transport` and `GroupMembership` adapter for tests and drills

use crate::application::forwarding_server::ForwardingServer;
use crate::domain::capability::Rank;
use crate::domain::membership::{GroupMembership, MembershipError};
use crate::domain::transport::{
    Completion, Opcode, RequestPayload, RpcHandle, RpcReply, Transport, TransportError,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

struct InFlight {
    opcode: Opcode,
    destination: Option<Rank>,
    wire: Vec<u8>,
    completion: Completion,
}

#[derive(Default)]
struct Members {
    servers: BTreeMap<Rank, Arc<ForwardingServer>>,
    evicted: BTreeSet<Rank>,
}

pub struct LoopbackFabric {
    group: String,
    members: Mutex<Members>,
    in_flight: Mutex<VecDeque<InFlight>>,
    faults: Mutex<VecDeque<TransportError>>,
    send_failures: AtomicUsize,
    sent: AtomicUsize,
    delivered: AtomicUsize,
}

impl LoopbackFabric {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            members: Mutex::new(Members::default()),
            in_flight: Mutex::new(VecDeque::new()),
            faults: Mutex::new(VecDeque::new()),
            send_failures: AtomicUsize::new(0),
            sent: AtomicUsize::new(0),
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn add_server(&self, server: Arc<ForwardingServer>) {
        let rank = server.rank();
        let mut members = self.members.lock();
        members.evicted.remove(&rank);
        members.servers.insert(rank, server);
        debug!("Rank {} joined {}", rank, self.group);
    }

    pub fn server(&self, rank: Rank) -> Option<Arc<ForwardingServer>> {
        self.members.lock().servers.get(&rank).cloned()
    }

    /// Remove `rank` from the group. RPCs to it complete with `Evicted`.
    pub fn evict(&self, rank: Rank) -> Option<Arc<ForwardingServer>> {
        let mut members = self.members.lock();
        members.evicted.insert(rank);
        let server = members.servers.remove(&rank);
        debug!("Rank {} evicted from {}", rank, self.group);
        server
    }

    pub fn ranks(&self) -> Vec<Rank> {
        self.members.lock().servers.keys().copied().collect()
    }

    /// Complete the next delivery with `error` instead of running the server.
    pub fn inject_fault(&self, error: TransportError) {
        self.faults.lock().push_back(error);
    }

    /// Make the next `count` sends fail synchronously.
    pub fn fail_next_sends(&self, count: usize) {
        self.send_failures.fetch_add(count, Ordering::SeqCst);
    }

    pub fn pending(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Opcodes of the queued RPCs, oldest first.
    pub fn pending_opcodes(&self) -> Vec<Opcode> {
        self.in_flight.lock().iter().map(|rpc| rpc.opcode).collect()
    }

    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Deliver the oldest queued RPC. Returns false if none was queued.
    pub fn progress_one(&self) -> bool {
        let next = self.in_flight.lock().pop_front();
        match next {
            Some(rpc) => {
                self.deliver(rpc);
                true
            }
            None => false,
        }
    }

    /// Deliver until the queue is empty, including RPCs sent by completions.
    pub fn progress(&self) -> usize {
        let mut count = 0;
        while self.progress_one() {
            count += 1;
        }
        count
    }

    /// Like [`progress`](Self::progress), but always delivers the most
    /// recently sent RPC first.
    pub fn progress_newest_first(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.in_flight.lock().pop_back();
            let Some(rpc) = next else {
                return count;
            };
            self.deliver(rpc);
            count += 1;
        }
    }

    fn deliver(&self, rpc: InFlight) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        let InFlight {
            opcode,
            destination,
            wire,
            completion,
        } = rpc;

        let result = self.execute(opcode, destination, &wire);
        trace!("Delivered {:?} to {:?}: {:?}", opcode, destination, result);
        completion(result);
    }

    fn execute(
        &self,
        opcode: Opcode,
        destination: Option<Rank>,
        wire: &[u8],
    ) -> Result<RpcReply, TransportError> {
        if let Some(fault) = self.faults.lock().pop_front() {
            return Err(fault);
        }

        let rank = destination.ok_or(TransportError::Unreachable)?;
        let server = {
            let members = self.members.lock();
            if members.evicted.contains(&rank) {
                return Err(TransportError::Evicted(rank));
            }
            members
                .servers
                .get(&rank)
                .cloned()
                .ok_or(TransportError::OutOfGroup(rank))?
        };

        let payload: RequestPayload =
            bincode::deserialize(wire).map_err(|e| TransportError::Other(e.to_string()))?;
        let reply = server.handle(opcode, &payload);
        let encoded =
            bincode::serialize(&reply).map_err(|e| TransportError::Other(e.to_string()))?;
        bincode::deserialize(&encoded).map_err(|e| TransportError::Other(e.to_string()))
    }
}

impl Transport for LoopbackFabric {
    fn create_request(
        &self,
        opcode: Opcode,
        destination_hint: Option<Rank>,
    ) -> Result<RpcHandle, TransportError> {
        Ok(RpcHandle::new(opcode, destination_hint))
    }

    fn set_destination(&self, rpc: &mut RpcHandle, rank: Rank) -> Result<(), TransportError> {
        rpc.address(rank);
        Ok(())
    }

    fn send(&self, rpc: RpcHandle, on_complete: Completion) -> Result<(), TransportError> {
        let injected = self
            .send_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Other("injected send failure".to_string()));
        }

        let (opcode, destination, payload) = rpc.into_parts();
        let wire = bincode::serialize(&payload).map_err(|e| TransportError::Other(e.to_string()))?;

        self.sent.fetch_add(1, Ordering::SeqCst);
        self.in_flight.lock().push_back(InFlight {
            opcode,
            destination,
            wire,
            completion: on_complete,
        });
        Ok(())
    }
}

impl GroupMembership for LoopbackFabric {
    fn primary_ranks(&self, group: &str) -> Result<Vec<Rank>, MembershipError> {
        if group != self.group {
            return Err(MembershipError::Unavailable {
                group: group.to_string(),
                reason: format!("fabric serves {}", self.group),
            });
        }
        let ranks = self.ranks();
        if ranks.is_empty() {
            return Err(MembershipError::NoMembers(group.to_string()));
        }
        Ok(ranks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::forwarding_server::ExportSpec;
    use crate::domain::forwarder_config::CapabilityConfig;
    use crate::domain::projection::ROOT_INODE;
    use crate::infrastructure::namespace::InMemoryNamespace;

    fn fabric_with(ranks: &[Rank]) -> LoopbackFabric {
        let fabric = LoopbackFabric::new("ionss");
        let namespace = Arc::new(InMemoryNamespace::new());
        for &rank in ranks {
            let server = ForwardingServer::new(
                rank,
                &CapabilityConfig::default(),
                namespace.clone(),
                vec![ExportSpec::new("scratch", ROOT_INODE)],
            )
            .unwrap();
            fabric.add_server(Arc::new(server));
        }
        fabric
    }

    fn capture() -> (Completion, Arc<Mutex<Option<Result<RpcReply, TransportError>>>>) {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        (Box::new(move |result: Result<RpcReply, TransportError>| *sink.lock() = Some(result)), slot)
    }

    fn register(fabric: &LoopbackFabric, rank: Rank) -> Arc<Mutex<Option<Result<RpcReply, TransportError>>>> {
        let mut rpc = fabric.create_request(Opcode::Register, None).unwrap();
        fabric.set_destination(&mut rpc, rank).unwrap();
        let (completion, slot) = capture();
        fabric.send(rpc, completion).unwrap();
        slot
    }

    #[test]
    fn test_delivery_waits_for_progress() {
        let fabric = fabric_with(&[0]);
        let slot = register(&fabric, 0);
        assert!(slot.lock().is_none());
        assert_eq!(fabric.pending_opcodes(), vec![Opcode::Register]);

        assert_eq!(fabric.progress(), 1);
        assert!(matches!(*slot.lock(), Some(Ok(RpcReply::Exports(ref e))) if e.len() == 1));
    }

    #[test]
    fn test_evicted_and_unknown_ranks() {
        let fabric = fabric_with(&[0, 1]);
        fabric.evict(0);
        let evicted = register(&fabric, 0);
        let unknown = register(&fabric, 9);
        fabric.progress();

        assert_eq!(*evicted.lock(), Some(Err(TransportError::Evicted(0))));
        assert_eq!(*unknown.lock(), Some(Err(TransportError::OutOfGroup(9))));
        assert_eq!(fabric.primary_ranks("ionss"), Ok(vec![1]));
    }

    #[test]
    fn test_faults_and_send_failures() {
        let fabric = fabric_with(&[0]);
        fabric.inject_fault(TransportError::Timeout);
        let faulted = register(&fabric, 0);
        fabric.progress();
        assert_eq!(*faulted.lock(), Some(Err(TransportError::Timeout)));

        fabric.fail_next_sends(1);
        let rpc = fabric.create_request(Opcode::Register, Some(0)).unwrap();
        let (completion, slot) = capture();
        assert!(fabric.send(rpc, completion).is_err());
        assert_eq!(fabric.pending(), 0);
        assert!(slot.lock().is_none());
    }

    #[test]
    fn test_newest_first_order() {
        let fabric = fabric_with(&[0]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..3 {
            let rpc = fabric.create_request(Opcode::Register, Some(0)).unwrap();
            let order = order.clone();
            fabric
                .send(rpc, Box::new(move |_: Result<RpcReply, TransportError>| order.lock().push(tag)))
                .unwrap();
        }
        assert_eq!(fabric.progress_newest_first(), 3);
        assert_eq!(*order.lock(), vec![2, 1, 0]);
    }

    #[test]
    fn test_empty_group_has_no_members() {
        let fabric = fabric_with(&[]);
        assert_eq!(
            fabric.primary_ranks("ionss"),
            Err(MembershipError::NoMembers("ionss".to_string()))
        );
        assert!(fabric.primary_ranks("other").is_err());
    }
}
