// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Loopback cluster shared by the integration tests.

#![allow(dead_code)]

use iof_core::application::failover::FailoverController;
use iof_core::application::forwarding_server::{ExportSpec, ForwardingServer};
use iof_core::application::request_lifecycle::{DispatcherSettings, RequestDispatcher};
use iof_core::domain::capability::Rank;
use iof_core::domain::forwarder_config::CapabilityConfig;
use iof_core::domain::membership::ServiceGroup;
use iof_core::domain::projection::{
    DirId, EntryInvalidator, FileId, InvalidateError, Projection, ROOT_INODE,
};
use iof_core::domain::request::{CapabilitySource, RequestError};
use iof_core::domain::transport::{
    EntryReply, InodeNum, Opcode, RequestPayload, RpcReply, Transport, TransportError,
};
use iof_core::infrastructure::event_bus::{EventBus, EventReceiver};
use iof_core::infrastructure::loopback::LoopbackFabric;
use iof_core::infrastructure::namespace::InMemoryNamespace;
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;

pub const GROUP: &str = "ionss";
pub const EXPORT: &str = "scratch";

pub type Outcome = mpsc::Receiver<Result<RpcReply, RequestError>>;

/// Records entry invalidations; answers `NotFound` for names in `forgotten`.
#[derive(Default)]
pub struct RecordingInvalidator {
    pub calls: Mutex<Vec<(InodeNum, String)>>,
    pub forgotten: Mutex<Vec<String>>,
}

impl EntryInvalidator for RecordingInvalidator {
    fn invalidate_entry(&self, parent: InodeNum, name: &str) -> Result<(), InvalidateError> {
        self.calls.lock().push((parent, name.to_string()));
        if self.forgotten.lock().iter().any(|n| n == name) {
            return Err(InvalidateError::NotFound);
        }
        Ok(())
    }
}

pub struct Cluster {
    pub namespace: Arc<InMemoryNamespace>,
    pub fabric: Arc<LoopbackFabric>,
    pub group: Arc<ServiceGroup>,
    pub dispatcher: Arc<RequestDispatcher>,
    pub controller: Arc<FailoverController>,
    pub bus: EventBus,
    pub invalidator: Arc<RecordingInvalidator>,
}

impl Cluster {
    pub fn new(ranks: &[Rank]) -> Self {
        Self::with_settings(ranks, DispatcherSettings::default())
    }

    pub fn with_settings(ranks: &[Rank], settings: DispatcherSettings) -> Self {
        let namespace = Arc::new(InMemoryNamespace::new());
        let fabric = Arc::new(LoopbackFabric::new(GROUP));
        for &rank in ranks {
            let server = ForwardingServer::new(
                rank,
                &CapabilityConfig::default(),
                namespace.clone(),
                vec![ExportSpec::new(EXPORT, ROOT_INODE)],
            )
            .unwrap();
            fabric.add_server(Arc::new(server));
        }

        let group = Arc::new(ServiceGroup::new(GROUP, ranks[0]));
        let dispatcher = RequestDispatcher::new(fabric.clone(), settings);
        let bus = EventBus::new(64);
        let controller = FailoverController::new(
            group.clone(),
            fabric.clone(),
            fabric.clone(),
            dispatcher.clone(),
            Arc::new(bus.clone()),
        );

        Self {
            namespace,
            fabric,
            group,
            dispatcher,
            controller,
            bus,
            invalidator: Arc::new(RecordingInvalidator::default()),
        }
    }

    pub fn events(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Raw RPC through the fabric, bypassing the request lifecycle.
    pub fn raw(&self, opcode: Opcode, rank: Rank, payload: RequestPayload) -> Result<RpcReply, TransportError> {
        let slot = Arc::new(Mutex::new(None));
        let sink = slot.clone();
        let mut rpc = self.fabric.create_request(opcode, Some(rank)).unwrap();
        self.fabric.set_destination(&mut rpc, rank).unwrap();
        *rpc.payload_mut() = payload;
        self.fabric
            .send(
                rpc,
                Box::new(move |result: Result<RpcReply, TransportError>| *sink.lock() = Some(result)),
            )
            .unwrap();
        self.fabric.progress();
        let result = slot.lock().take();
        result.expect("raw RPC did not complete")
    }

    /// Register with the primary and build a projection of the export.
    pub fn mount(&self, id: u32, failover: bool) -> Arc<Projection> {
        let primary = self.group.primary_rank();
        let root = match self.raw(Opcode::Register, primary, RequestPayload::default()) {
            Ok(RpcReply::Exports(exports)) => {
                exports.into_iter().find(|e| e.name == EXPORT).unwrap().root
            }
            other => panic!("registration failed: {:?}", other),
        };
        let projection = Arc::new(Projection::new(
            id,
            EXPORT,
            self.group.clone(),
            failover,
            root,
            self.invalidator.clone(),
        ));
        self.controller.register_projection(projection.clone());
        projection
    }

    /// Submit without driving the fabric.
    pub fn submit(
        &self,
        projection: &Arc<Projection>,
        opcode: Opcode,
        source: CapabilitySource,
        payload: RequestPayload,
    ) -> Outcome {
        let (tx, rx) = mpsc::channel();
        let mut request = self.dispatcher.acquire();
        request.prepare(
            projection.clone(),
            opcode,
            source,
            move |result: Result<RpcReply, RequestError>| {
                let _ = tx.send(result);
            },
        );
        *request.payload_mut() = payload;
        let _ = self.dispatcher.submit(request);
        rx
    }

    /// Submit, drive the fabric to quiescence and return the single result.
    pub fn run(
        &self,
        projection: &Arc<Projection>,
        opcode: Opcode,
        source: CapabilitySource,
        payload: RequestPayload,
    ) -> Result<RpcReply, RequestError> {
        let rx = self.submit(projection, opcode, source, payload);
        self.fabric.progress();
        let result = rx.try_recv().expect("request did not complete");
        assert!(rx.try_recv().is_err(), "handler invoked more than once");
        result
    }

    pub fn lookup(&self, projection: &Arc<Projection>, parent: InodeNum, name: &str) -> EntryReply {
        let source = if parent == ROOT_INODE {
            CapabilitySource::Root
        } else {
            CapabilitySource::Inode(parent)
        };
        let payload = RequestPayload {
            name: name.to_string(),
            ..Default::default()
        };
        match self.run(projection, Opcode::Lookup, source, payload) {
            Ok(RpcReply::Entry(entry)) => {
                projection.insert_inode(entry.attr.ino, parent, name, entry.capability);
                entry
            }
            other => panic!("lookup of {} failed: {:?}", name, other),
        }
    }

    pub fn open(&self, projection: &Arc<Projection>, ino: InodeNum) -> FileId {
        match self.run(projection, Opcode::Open, CapabilitySource::Inode(ino), RequestPayload::default()) {
            Ok(RpcReply::Entry(entry)) => projection.open_file(ino, entry.capability),
            other => panic!("open of {} failed: {:?}", ino, other),
        }
    }

    pub fn opendir(&self, projection: &Arc<Projection>, ino: InodeNum) -> DirId {
        let source = if ino == ROOT_INODE {
            CapabilitySource::Root
        } else {
            CapabilitySource::Inode(ino)
        };
        match self.run(projection, Opcode::Opendir, source, RequestPayload::default()) {
            Ok(RpcReply::Entry(entry)) => projection.open_dir(ino, entry.capability),
            other => panic!("opendir of {} failed: {:?}", ino, other),
        }
    }

    pub fn read_payload(offset: u64, length: u32) -> RequestPayload {
        RequestPayload {
            offset,
            length,
            ..Default::default()
        }
    }

    pub fn read(
        &self,
        projection: &Arc<Projection>,
        file: FileId,
        offset: u64,
        length: u32,
    ) -> Result<RpcReply, RequestError> {
        self.run(
            projection,
            Opcode::Read,
            CapabilitySource::File(file),
            Self::read_payload(offset, length),
        )
    }

    /// Evict `rank` from the fabric and tell the controller.
    pub fn evict(&self, rank: Rank) {
        self.fabric.evict(rank);
        self.controller.on_rank_evicted(GROUP, rank);
    }
}
