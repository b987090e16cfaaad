// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Failover drill
//!
//! Builds a server group on the loopback fabric, mounts one projection, opens
//! a set of files and keeps a read in flight on each. It then evicts a rank
//! and reports what the failover controller did and how the reads ended.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use tracing::info;

use iof_core::application::failover::FailoverController;
use iof_core::application::forwarding_server::{ExportSpec, ForwardingServer};
use iof_core::application::request_lifecycle::{DispatcherSettings, RequestDispatcher};
use iof_core::domain::capability::{Capability, Rank, MAX_CAPABILITY_RANK};
use iof_core::domain::events::FailoverEvent;
use iof_core::domain::forwarder_config::ForwarderConfigManifest;
use iof_core::domain::membership::ServiceGroup;
use iof_core::domain::projection::{
    EntryInvalidator, FileId, InvalidateError, Projection, ROOT_INODE,
};
use iof_core::domain::request::{CapabilitySource, RequestError};
use iof_core::domain::transport::{
    Completion, InodeNum, Opcode, RequestPayload, RpcReply, Transport, TransportError,
};
use iof_core::infrastructure::event_bus::EventBus;
use iof_core::infrastructure::loopback::LoopbackFabric;
use iof_core::infrastructure::namespace::InMemoryNamespace;

#[derive(Args, Debug, Clone)]
pub struct DrillArgs {
    /// Server ranks in the simulated group
    #[arg(long, default_value_t = 3)]
    pub ranks: Rank,

    /// Files to open before the eviction
    #[arg(long, default_value_t = 4)]
    pub files: usize,

    /// Rank to evict (default: the primary service rank)
    #[arg(long)]
    pub evict: Option<Rank>,

    /// Mount the projection with failover disabled
    #[arg(long)]
    pub no_failover: bool,

    /// Deliver the newest RPC first instead of the oldest
    #[arg(long)]
    pub newest_first: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

impl Default for DrillArgs {
    fn default() -> Self {
        Self {
            ranks: 3,
            files: 4,
            evict: None,
            no_failover: false,
            newest_first: false,
            json: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DrillReport {
    pub group: String,
    pub projection: String,
    pub evicted_rank: Rank,
    pub primary_before: Rank,
    pub primary_after: Rank,
    pub state: String,
    pub open_files: usize,
    pub reads_succeeded: usize,
    pub reads_failed: usize,
    pub live_handles: usize,
    pub events: Vec<FailoverEvent>,
}

pub async fn handle_command(args: DrillArgs, config_override: Option<PathBuf>) -> Result<()> {
    let config = ForwarderConfigManifest::load_or_default(config_override)
        .context("Failed to load configuration")?;
    config
        .validate()
        .context("Configuration validation failed")?;

    let report = run_drill(&config, &args)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

/// Logs the entries the failover controller asks to invalidate.
struct LoggingInvalidator;

impl EntryInvalidator for LoggingInvalidator {
    fn invalidate_entry(&self, parent: InodeNum, name: &str) -> Result<(), InvalidateError> {
        info!("Invalidating directory entry {} under inode {}", name, parent);
        Ok(())
    }
}

struct Drill {
    fabric: Arc<LoopbackFabric>,
    dispatcher: Arc<RequestDispatcher>,
    newest_first: bool,
}

impl Drill {
    fn progress(&self) {
        if self.newest_first {
            self.fabric.progress_newest_first();
        } else {
            self.fabric.progress();
        }
    }

    fn submit(
        &self,
        projection: &Arc<Projection>,
        opcode: Opcode,
        source: CapabilitySource,
        payload: RequestPayload,
    ) -> mpsc::Receiver<Result<RpcReply, RequestError>> {
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
        // Early failures are delivered through the channel as well.
        let _ = self.dispatcher.submit(request);
        rx
    }

    fn call(
        &self,
        projection: &Arc<Projection>,
        opcode: Opcode,
        source: CapabilitySource,
        payload: RequestPayload,
    ) -> Result<RpcReply> {
        let rx = self.submit(projection, opcode, source, payload);
        self.progress();
        let result = rx
            .try_recv()
            .with_context(|| format!("{:?} did not complete", opcode))?;
        result.with_context(|| format!("{:?} failed", opcode))
    }

    /// Register with `rank` and return the root capability of `export`.
    fn register(&self, rank: Rank, export: &str) -> Result<Capability> {
        let (tx, rx) = mpsc::channel();
        let mut rpc = self.fabric.create_request(Opcode::Register, Some(rank))?;
        self.fabric.set_destination(&mut rpc, rank)?;
        let completion: Completion = Box::new(move |result: Result<RpcReply, TransportError>| {
            let _ = tx.send(result);
        });
        self.fabric.send(rpc, completion)?;
        self.progress();
        match rx.try_recv().context("Registration did not complete")?? {
            RpcReply::Exports(exports) => exports
                .into_iter()
                .find(|e| e.name == export)
                .map(|e| e.root)
                .with_context(|| format!("Export {} not offered by rank {}", export, rank)),
            other => bail!("Unexpected registration reply: {:?}", other),
        }
    }
}

fn entry(reply: RpcReply) -> Result<(Capability, InodeNum)> {
    match reply {
        RpcReply::Entry(entry) => Ok((entry.capability, entry.attr.ino)),
        other => bail!("Expected an entry reply, got {:?}", other),
    }
}

/// Run one drill and report its outcome.
pub fn run_drill(config: &ForwarderConfigManifest, args: &DrillArgs) -> Result<DrillReport> {
    if args.ranks == 0 || args.ranks > MAX_CAPABILITY_RANK + 1 {
        bail!("--ranks must be between 1 and {}", MAX_CAPABILITY_RANK + 1);
    }

    let spec = &config.spec;
    let (export, failover) = spec
        .projections
        .first()
        .map(|p| (p.name.clone(), p.failover))
        .unwrap_or_else(|| ("scratch".to_string(), true));
    let failover = failover && !args.no_failover;

    let primary = if spec.group.primary_rank < args.ranks {
        spec.group.primary_rank
    } else {
        0
    };
    let evicted = args.evict.unwrap_or(primary);
    if evicted >= args.ranks {
        bail!("Cannot evict rank {}: group has ranks 0..{}", evicted, args.ranks);
    }

    // Cluster
    let namespace = Arc::new(InMemoryNamespace::new());
    let fabric = Arc::new(LoopbackFabric::new(spec.group.name.clone()));
    for rank in 0..args.ranks {
        let server = ForwardingServer::new(
            rank,
            &spec.capabilities,
            namespace.clone(),
            vec![ExportSpec::new(export.clone(), ROOT_INODE)],
        )
        .with_context(|| format!("Failed to start forwarding server on rank {}", rank))?;
        fabric.add_server(Arc::new(server));
    }

    let group = Arc::new(ServiceGroup::new(spec.group.name.clone(), primary));
    let dispatcher = RequestDispatcher::new(
        fabric.clone(),
        DispatcherSettings::from(spec.requests.clone()),
    );
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let controller = FailoverController::new(
        group.clone(),
        fabric.clone(),
        fabric.clone(),
        dispatcher.clone(),
        Arc::new(bus.clone()),
    );
    let drill = Drill {
        fabric: fabric.clone(),
        dispatcher,
        newest_first: args.newest_first,
    };

    // Mount
    let root = drill.register(primary, &export)?;
    let projection = Arc::new(Projection::new(
        1,
        export.clone(),
        group.clone(),
        failover,
        root,
        Arc::new(LoggingInvalidator),
    ));
    controller.register_projection(projection.clone());

    // Populate and open
    let dir = namespace.mkdir(ROOT_INODE, "drill")?;
    let lookup = RequestPayload {
        name: "drill".to_string(),
        ..Default::default()
    };
    let (dir_cap, dir_ino) = entry(drill.call(&projection, Opcode::Lookup, CapabilitySource::Root, lookup)?)?;
    projection.insert_inode(dir_ino, ROOT_INODE, "drill", dir_cap);

    let mut files: Vec<FileId> = Vec::with_capacity(args.files);
    for i in 0..args.files {
        let name = format!("file{}", i);
        namespace.create_file(dir, &name, format!("contents of {}", name).into_bytes())?;
        let lookup = RequestPayload {
            name: name.clone(),
            ..Default::default()
        };
        let (cap, ino) = entry(drill.call(
            &projection,
            Opcode::Lookup,
            CapabilitySource::Inode(dir_ino),
            lookup,
        )?)?;
        projection.insert_inode(ino, dir_ino, name, cap);

        let (file_cap, _) = entry(drill.call(
            &projection,
            Opcode::Open,
            CapabilitySource::Inode(ino),
            RequestPayload::default(),
        )?)?;
        files.push(projection.open_file(ino, file_cap));
    }

    // Reads in flight at eviction time
    let reads: Vec<_> = files
        .iter()
        .map(|file| {
            drill.submit(
                &projection,
                Opcode::Read,
                CapabilitySource::File(*file),
                RequestPayload {
                    length: 64,
                    ..Default::default()
                },
            )
        })
        .collect();

    info!("Evicting rank {} from {}", evicted, spec.group.name);
    fabric.evict(evicted);
    controller.on_rank_evicted(&spec.group.name, evicted);
    drill.progress();

    let mut reads_succeeded = 0;
    let mut reads_failed = 0;
    for rx in reads {
        match rx.try_recv() {
            Ok(Ok(_)) => reads_succeeded += 1,
            _ => reads_failed += 1,
        }
    }

    let live_handles = {
        let table = projection.lock_caps();
        files
            .iter()
            .filter(|id| table.file(**id).map(|f| f.valid).unwrap_or(false))
            .count()
    };

    Ok(DrillReport {
        group: spec.group.name.clone(),
        projection: export,
        evicted_rank: evicted,
        primary_before: primary,
        primary_after: group.primary_rank(),
        state: projection.state().to_string(),
        open_files: files.len(),
        reads_succeeded,
        reads_failed,
        live_handles,
        events: events.drain(),
    })
}

fn print_report(report: &DrillReport) {
    println!("{}", "Failover drill".bold());
    println!();
    println!("  Group: {}", report.group);
    println!("  Projection: {}", report.projection);
    println!("  Evicted rank: {}", report.evicted_rank);
    println!(
        "  Primary service rank: {} → {}",
        report.primary_before, report.primary_after
    );

    let state = match report.state.as_str() {
        "running" => report.state.green(),
        "offline" => report.state.red(),
        _ => report.state.yellow(),
    };
    println!("  State: {}", state);
    println!(
        "  Open files still live: {}/{}",
        report.live_handles, report.open_files
    );
    println!(
        "  In-flight reads: {} succeeded, {} failed",
        report.reads_succeeded.to_string().green(),
        report.reads_failed.to_string().red()
    );
    println!();

    println!("{}", "Events:".bold());
    for event in &report.events {
        match event {
            FailoverEvent::RankEvicted { rank, primary_rank, .. } => {
                println!("  rank {} evicted, primary now {:?}", rank, primary_rank)
            }
            FailoverEvent::MigrationStarted {
                invalidated_handles,
                ..
            } => println!("  migration started, {} handles invalidated", invalidated_handles),
            FailoverEvent::MigrationCompleted {
                migrated_inodes,
                invalidated_inodes,
                resent_requests,
                ..
            } => println!(
                "  migration complete: {} migrated, {} invalidated, {} resent",
                migrated_inodes, invalidated_inodes, resent_requests
            ),
            FailoverEvent::ProjectionOffline {
                reason,
                failed_requests,
                ..
            } => println!(
                "  projection offline ({:?}), {} requests failed",
                reason, failed_requests
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iof_core::domain::projection::OfflineReason;

    #[test]
    fn test_drill_with_failover_keeps_reads_alive() {
        let config = ForwarderConfigManifest::default();
        let report = run_drill(&config, &DrillArgs::default()).unwrap();

        assert_eq!(report.evicted_rank, 0);
        assert_eq!(report.primary_after, 1);
        assert_eq!(report.state, "running");
        assert_eq!(report.reads_succeeded, 4);
        assert_eq!(report.live_handles, 4);
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, FailoverEvent::MigrationCompleted { resent_requests: 4, .. })));
    }

    #[test]
    fn test_drill_without_failover_goes_offline() {
        let config = ForwarderConfigManifest::default();
        let args = DrillArgs {
            no_failover: true,
            newest_first: true,
            ..DrillArgs::default()
        };
        let report = run_drill(&config, &args).unwrap();

        assert_eq!(report.state, "offline");
        assert_eq!(report.reads_failed, 4);
        assert!(report.events.iter().any(|e| matches!(
            e,
            FailoverEvent::ProjectionOffline {
                reason: OfflineReason::HostDown,
                ..
            }
        )));
    }

    #[test]
    fn test_evicting_a_secondary_leaves_primary() {
        let config = ForwarderConfigManifest::default();
        let args = DrillArgs {
            evict: Some(2),
            ..DrillArgs::default()
        };
        let report = run_drill(&config, &args).unwrap();

        assert_eq!(report.primary_after, 0);
        assert_eq!(report.reads_succeeded, 4);
        assert_eq!(report.state, "running");
    }

    #[test]
    fn test_rejects_out_of_range_eviction() {
        let config = ForwarderConfigManifest::default();
        let args = DrillArgs {
            evict: Some(7),
            ..DrillArgs::default()
        };
        assert!(run_drill(&config, &args).is_err());
    }
}
