// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Request Lifecycle
//!
//! Drives one client operation from `Reset` to a single result-handler call.
//!
//! ## Send
//! 1. Admission: an offline projection fails the request with its recorded
//!    reason; a projection in the middle of a migration parks it on its
//!    deferred queue.
//! 2. Under the capability lock, resolve the capability source and copy the
//!    capability into the payload. Objects marked not live fail with
//!    `HostDown` without any network traffic.
//! 3. Address a fresh RPC (root and capability-less requests go to the
//!    primary service rank, everything else to the capability's root rank),
//!    copy the payload in and send. The request is now `Live`.
//!
//! ## Completion
//! - success: handler gets the reply, or the error a server reported in it
//! - projection offline: handler gets the offline reason
//! - transient transport error: resend, bounded by `max_transient_resends`
//! - evicted / out-of-group: park while migrating, otherwise resend
//! - anything else: handler gets `Io`
//!
//! Once the handler has run the request goes back to the descriptor pool.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Resend / defer / fail state machine for client requests

use crate::domain::capability::{Capability, Rank};
use crate::domain::forwarder_config::RequestConfig;
use crate::domain::pool::{ObjectPool, PoolStats};
use crate::domain::projection::{Admission, CapabilityTable, OfflineReason, Projection, ROOT_INODE};
use crate::domain::request::{CapabilitySource, Request, RequestError, RequestState};
use crate::domain::transport::{Completion, RpcReply, ServerStatus, Transport, TransportError};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Resends allowed per request after transient or host-down errors
    pub max_transient_resends: u32,
    /// Descriptors kept ready in the request pool
    pub pool_target: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        RequestConfig::default().into()
    }
}

impl From<RequestConfig> for DispatcherSettings {
    fn from(config: RequestConfig) -> Self {
        Self {
            max_transient_resends: config.max_transient_resends,
            pool_target: config.pool_target,
        }
    }
}

pub struct RequestDispatcher {
    transport: Arc<dyn Transport>,
    pool: ObjectPool<Request>,
    settings: DispatcherSettings,
}

impl RequestDispatcher {
    pub fn new(transport: Arc<dyn Transport>, settings: DispatcherSettings) -> Arc<Self> {
        Arc::new(Self {
            transport,
            pool: ObjectPool::new("requests", settings.pool_target),
            settings,
        })
    }

    /// Take a request descriptor from the pool. Populate it with
    /// [`Request::prepare`] before submitting.
    pub fn acquire(&self) -> Box<Request> {
        self.pool.acquire()
    }

    pub fn restock(&self) {
        self.pool.restock();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Send a prepared request.
    ///
    /// `Err` means the request failed before reaching the transport; its
    /// result handler has already been called with the same error.
    pub fn submit(self: &Arc<Self>, request: Box<Request>) -> Result<(), RequestError> {
        if request.state != RequestState::Reset || request.projection.is_none() {
            warn!("Rejecting unprepared request: {:?}", request);
            self.finish(request, Err(RequestError::InvalidArgument));
            return Err(RequestError::InvalidArgument);
        }
        self.send(request)
    }

    /// Put a request that left `Live` without finishing back on the wire.
    pub(crate) fn resend(self: &Arc<Self>, mut request: Box<Request>) {
        request.state = RequestState::Reset;
        // Failures have already reached the handler.
        let _ = self.send(request);
    }

    /// Fail requests that can no longer be sent.
    pub(crate) fn fail_all(&self, requests: Vec<Box<Request>>, reason: OfflineReason) -> usize {
        let count = requests.len();
        for request in requests {
            self.finish(request, Err(reason.into()));
        }
        count
    }

    fn send(self: &Arc<Self>, request: Box<Request>) -> Result<(), RequestError> {
        let Some(projection) = request.projection.clone() else {
            self.finish(request, Err(RequestError::InvalidArgument));
            return Err(RequestError::InvalidArgument);
        };

        let request = match projection.admit(request) {
            Admission::Proceed(request) => request,
            Admission::Deferred => {
                debug!("Projection {} is migrating, request deferred", projection.id());
                return Ok(());
            }
            Admission::Offline(request, reason) => {
                debug!("Projection {} offline, failing request", projection.id());
                let err = RequestError::from(reason);
                self.finish(request, Err(err));
                return Err(err);
            }
        };

        match self.transmit(&projection, request) {
            Ok(()) => Ok(()),
            Err((request, err)) => {
                self.finish(request, Err(err));
                Err(err)
            }
        }
    }

    fn transmit(
        self: &Arc<Self>,
        projection: &Arc<Projection>,
        mut request: Box<Request>,
    ) -> Result<(), (Box<Request>, RequestError)> {
        let target = {
            let table = projection.lock_caps();
            resolve_target(&table, projection, &mut request.source)
        };
        let (capability, rank) = match target {
            Ok(target) => target,
            Err(err) => {
                debug!("Not sending {:?} for {:?}: {}", request.opcode, request.source, err);
                return Err((request, err));
            }
        };
        if let Some(capability) = capability {
            request.payload.capability = capability;
        }

        let mut rpc = match self.transport.create_request(request.opcode, Some(rank)) {
            Ok(rpc) => rpc,
            Err(e) => {
                warn!("Could not create {:?} RPC: {}", request.opcode, e);
                return Err((request, RequestError::Io));
            }
        };
        if let Err(e) = self.transport.set_destination(&mut rpc, rank) {
            warn!("Could not address {:?} RPC to rank {}: {}", request.opcode, rank, e);
            return Err((request, RequestError::Io));
        }
        *rpc.payload_mut() = request.payload.clone();

        request.state = RequestState::Live;
        let opcode = request.opcode;
        let slot = Arc::new(Mutex::new(Some(request)));

        let in_flight = Arc::clone(&slot);
        let dispatcher = Arc::clone(self);
        let completion: Completion = Box::new(move |result: Result<RpcReply, TransportError>| {
            let request = in_flight.lock().take();
            if let Some(request) = request {
                dispatcher.on_complete(request, result);
            }
        });

        if let Err(e) = self.transport.send(rpc, completion) {
            warn!("Failed to send {:?} to rank {}: {}", opcode, rank, e);
            let request = slot.lock().take();
            return match request {
                Some(mut request) => {
                    request.state = RequestState::Reset;
                    Err((request, RequestError::Io))
                }
                None => Ok(()),
            };
        }

        debug!("Sent {:?} to rank {}", opcode, rank);
        Ok(())
    }

    fn on_complete(self: &Arc<Self>, mut request: Box<Request>, result: Result<RpcReply, TransportError>) {
        if request.state != RequestState::Live {
            error!("Completion for request not in flight: {:?}", request);
        }
        request.state = RequestState::Reset;

        let Some(projection) = request.projection.clone() else {
            self.finish(request, Err(RequestError::Io));
            return;
        };

        let error = match result {
            Ok(reply) => {
                if reply == RpcReply::Failed(ServerStatus::Stale) {
                    invalidate_stale(&projection, request.source);
                }
                self.finish(request, reply.into_result());
                return;
            }
            Err(error) => error,
        };

        if let Some(reason) = projection.offline_reason() {
            info!("{:?} failed on offline projection {}: {}", request.opcode, projection.id(), error);
            self.finish(request, Err(reason.into()));
            return;
        }

        if !error.is_transient() && !error.is_host_down() {
            warn!("{:?} failed: {}", request.opcode, error);
            self.finish(request, Err(RequestError::Io));
            return;
        }

        if request.resends >= self.settings.max_transient_resends {
            warn!(
                "{:?} still failing after {} resends: {}",
                request.opcode, request.resends, error
            );
            let err = if error.is_host_down() {
                RequestError::HostDown
            } else {
                RequestError::Io
            };
            self.finish(request, Err(err));
            return;
        }

        // While a migration runs, admission parks the request instead.
        request.resends += 1;
        info!(
            "Resending {:?} after {} (attempt {})",
            request.opcode, error, request.resends
        );
        let _ = self.send(request);
    }

    fn finish(&self, mut request: Box<Request>, result: Result<RpcReply, RequestError>) {
        match request.handler.take() {
            Some(handler) => handler.on_result(result),
            None => error!("Request finished without a result handler: {:?}", request),
        }
        self.pool.release(request);
    }
}

/// Pick the capability to send and the rank to send it to.
fn resolve_target(
    table: &CapabilityTable,
    projection: &Projection,
    source: &mut CapabilitySource,
) -> Result<(Option<Capability>, Rank), RequestError> {
    if let CapabilitySource::InodeNum(ino) = *source {
        *source = if ino == ROOT_INODE {
            CapabilitySource::Root
        } else if table.inode(ino).is_some() {
            CapabilitySource::Inode(ino)
        } else {
            return Err(RequestError::NotFound);
        };
    }

    let primary = projection.group().primary_rank();
    match *source {
        CapabilitySource::None => Ok((None, primary)),
        CapabilitySource::Root => Ok((Some(table.root()), primary)),
        CapabilitySource::Inode(ino) => {
            let entry = table.inode(ino).ok_or(RequestError::NotFound)?;
            live(entry.valid, entry.capability)
        }
        CapabilitySource::File(id) => {
            let file = table.file(id).ok_or(RequestError::NotFound)?;
            live(file.valid, file.capability)
        }
        CapabilitySource::Dir(id) => {
            let dir = table.dir(id).ok_or(RequestError::NotFound)?;
            live(dir.valid && dir.handle_valid, dir.capability)
        }
        CapabilitySource::InodeNum(_) => Err(RequestError::NotFound),
    }
}

fn live(valid: bool, capability: Capability) -> Result<(Option<Capability>, Rank), RequestError> {
    if !valid {
        return Err(RequestError::HostDown);
    }
    Ok((Some(capability), capability.root_rank()))
}

fn invalidate_stale(projection: &Projection, source: CapabilitySource) {
    match projection.try_lock_caps() {
        Some(mut table) => {
            if table.invalidate_source(source) {
                info!("Server reports stale capability for {:?}, marked not live", source);
            }
        }
        None => debug!("Capability lock busy, leaving {:?} to failover", source),
    }
}
