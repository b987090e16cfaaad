// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Use cases of the forwarding layer
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Request dispatch, failover orchestration and server-side
//!   request handling

pub mod failover;
pub mod forwarding_server;
pub mod request_lifecycle;
