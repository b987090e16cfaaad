// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Adapters for the forwarding core
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Event fan-out, in-memory namespace and the loopback RPC
//!   fabric

pub mod event_bus;
pub mod loopback;
pub mod namespace;
