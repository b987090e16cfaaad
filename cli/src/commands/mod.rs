// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the I/O forwarder CLI

pub mod config;
pub mod drill;

pub use self::config::ConfigCommand;
pub use self::drill::DrillArgs;
