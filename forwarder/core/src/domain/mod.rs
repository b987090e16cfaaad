// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain model of the forwarding layer
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Capabilities, client object records, requests and the
//!   ports the application layer drives

pub mod capability;
pub mod capability_store;
pub mod events;
pub mod forwarder_config;
pub mod membership;
pub mod namespace;
pub mod pool;
pub mod projection;
pub mod request;
pub mod transport;
