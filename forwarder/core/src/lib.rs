// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! I/O forwarding core
//!
//! Capability handles issued by forwarding servers, and the client-side
//! machinery that keeps them usable across server-rank eviction.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Crate root

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
