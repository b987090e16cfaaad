// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Pending request record
//!
//! One outstanding client operation: its payload, where its capability comes
//! from, its lifecycle state and the handler that receives the result. The
//! state machine that drives it lives in
//! [`crate::application::request_lifecycle`].
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Request entity, capability source and result contract

use crate::domain::pool::Poolable;
use crate::domain::projection::{DirId, FileId, OfflineReason, Projection};
use crate::domain::transport::{InodeNum, Opcode, RequestPayload, RpcReply, ServerStatus};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error delivered to a request's result handler.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    #[error("Object not found")]
    NotFound,

    #[error("Host down")]
    HostDown,

    #[error("Invalid argument")]
    InvalidArgument,

    #[error("Out of memory")]
    OutOfMemory,

    #[error("I/O error")]
    Io,
}

impl From<OfflineReason> for RequestError {
    fn from(reason: OfflineReason) -> Self {
        match reason {
            OfflineReason::HostDown => RequestError::HostDown,
            OfflineReason::InvalidArgument => RequestError::InvalidArgument,
            OfflineReason::Io => RequestError::Io,
        }
    }
}

impl From<ServerStatus> for RequestError {
    fn from(status: ServerStatus) -> Self {
        match status {
            ServerStatus::NoEntry | ServerStatus::Stale => RequestError::NotFound,
            ServerStatus::Invalid => RequestError::InvalidArgument,
            ServerStatus::NoMemory => RequestError::OutOfMemory,
            ServerStatus::Io => RequestError::Io,
        }
    }
}

impl RpcReply {
    /// Fold a server-reported failure into the error channel.
    pub fn into_result(self) -> Result<RpcReply, RequestError> {
        match self {
            RpcReply::Failed(status) => Err(status.into()),
            other => Ok(other),
        }
    }
}

/// Receives the outcome of a request. Invoked exactly once.
pub trait ResultHandler: Send {
    fn on_result(self: Box<Self>, result: Result<RpcReply, RequestError>);
}

impl<F> ResultHandler for F
where
    F: FnOnce(Result<RpcReply, RequestError>) + Send,
{
    fn on_result(self: Box<Self>, result: Result<RpcReply, RequestError>) {
        (*self)(result)
    }
}

/// Where the outgoing capability is read from at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilitySource {
    /// No capability, addressed to the primary service rank
    #[default]
    None,
    /// The projection's root capability
    Root,
    Inode(InodeNum),
    File(FileId),
    Dir(DirId),
    /// Resolved to `Root` or `Inode` when the request is sent
    InodeNum(InodeNum),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Created, never populated
    #[default]
    Init,
    /// Populated, ready to send
    Reset,
    /// Sent, waiting for exactly one completion
    Live,
}

#[derive(Default)]
pub struct Request {
    pub(crate) projection: Option<Arc<Projection>>,
    pub(crate) opcode: Opcode,
    pub(crate) source: CapabilitySource,
    pub(crate) payload: RequestPayload,
    pub(crate) state: RequestState,
    pub(crate) resends: u32,
    pub(crate) handler: Option<Box<dyn ResultHandler>>,
}

impl Request {
    /// Populate a pooled request and move it to `Reset`.
    pub fn prepare(
        &mut self,
        projection: Arc<Projection>,
        opcode: Opcode,
        source: CapabilitySource,
        handler: impl ResultHandler + 'static,
    ) {
        self.projection = Some(projection);
        self.opcode = opcode;
        self.source = source;
        self.payload = RequestPayload::default();
        self.resends = 0;
        self.handler = Some(Box::new(handler));
        self.state = RequestState::Reset;
    }

    pub fn payload_mut(&mut self) -> &mut RequestPayload {
        &mut self.payload
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn source(&self) -> CapabilitySource {
        self.source
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn projection(&self) -> Option<&Arc<Projection>> {
        self.projection.as_ref()
    }

    /// Number of transient-error resends so far.
    pub fn resends(&self) -> u32 {
        self.resends
    }
}

impl Poolable for Request {}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("projection", &self.projection.as_ref().map(|p| p.id()))
            .field("opcode", &self.opcode)
            .field("source", &self.source)
            .field("state", &self.state)
            .field("resends", &self.resends)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_result_handler() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handler: Box<dyn ResultHandler> = Box::new(move |result: Result<RpcReply, RequestError>| {
            let _ = tx.send(result);
        });

        handler.on_result(Err(RequestError::HostDown));
        assert_eq!(rx.recv().unwrap(), Err(RequestError::HostDown));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut request = Request {
            opcode: Opcode::Read,
            source: CapabilitySource::Inode(9),
            state: RequestState::Live,
            resends: 3,
            handler: Some(Box::new(|_: Result<RpcReply, RequestError>| {})),
            ..Default::default()
        };
        request.payload.name = "x".to_string();

        assert!(request.reset());
        assert_eq!(request.state(), RequestState::Init);
        assert_eq!(request.source(), CapabilitySource::None);
        assert_eq!(request.resends(), 0);
        assert!(request.handler.is_none());
        assert!(request.payload().name.is_empty());
    }

    #[test]
    fn test_server_status_mapping() {
        assert_eq!(
            RpcReply::Failed(ServerStatus::Stale).into_result(),
            Err(RequestError::NotFound)
        );
        assert_eq!(RpcReply::Done.into_result(), Ok(RpcReply::Done));
    }
}
