//! # pgtrace - Main Entry Point
//!
//! Resolves the layout descriptor for the requested server version,
//! loads and attaches the probe programs, then drains the ring buffer
//! until interrupted.

// Wire pids are u32 by contract, CLI pids are i32 by POSIX
#![allow(clippy::cast_possible_wrap)]

use anyhow::{Context, Result};
use aya::maps::{RingBuf, StackTraceMap};
use clap::Parser;
use log::{info, warn};
use std::time::Duration;

use pgtrace::cli::Args;
use pgtrace::domain::{StackId, TracerError};
use pgtrace::output::{render_event, OutputSink, StackRender, Statistics};
use pgtrace::preflight::run_preflight_checks;
use pgtrace::probes;
use pgtrace::symbolization::{executable_range, StackResolver, Symbolizer};
use pgtrace_common::events::{parse, Event, GLOBAL_EVENT_THRESHOLD};
use pgtrace_common::{LayoutDescriptor, PostgresVersion};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            if e.to_string().to_lowercase().contains("permission denied") {
                EXIT_NOPERM
            } else {
                EXIT_ERROR
            }
        }
    });
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    let version = PostgresVersion::from_server_version(&args.postgres_version)
        .map_err(TracerError::LayoutRejected)?;
    let families = args.families();

    run_preflight_checks(&args.exe, &args.pids)?;

    // Resolving the layout up front is the attach gate: an unaudited
    // (struct, field, version) combination refuses the whole family here,
    // before a single probe is placed.
    let layout =
        LayoutDescriptor::resolve(version, families).map_err(TracerError::LayoutRejected)?;

    info!("===> Loading BPF programs");
    let mut bpf = probes::load_ebpf_program()?;
    probes::init_ebpf_logger(&mut bpf);
    probes::publish_layout(&mut bpf, &layout)?;
    probes::publish_config(&mut bpf, args.stack_sites(), args.error_level)?;

    info!("===> Attaching BPF probes");
    probes::attach_probes(&mut bpf, families, &args.exe)?;

    let mut ring_buf =
        RingBuf::try_from(bpf.take_map("EVENTS").ok_or(TracerError::MapNotFound("EVENTS"))?)?;

    // Stack resolution machinery only when stacktraces were requested.
    let want_stacks = args.stacktrace.is_some();
    let stack_traces = if want_stacks {
        let map = bpf
            .take_map("STACK_TRACES")
            .ok_or(TracerError::MapNotFound("STACK_TRACES"))?;
        Some(StackTraceMap::try_from(map)?)
    } else {
        None
    };
    let symbolizer = if want_stacks { Some(Symbolizer::new(&args.exe)?) } else { None };
    let memory_range = match (want_stacks, args.pids.first()) {
        (true, Some(&pid)) => match executable_range(pid, &args.exe) {
            Ok(range) => Some(range),
            Err(e) => {
                warn!("Cannot determine the executable base ({e}); stacks stay raw");
                None
            }
        },
        _ => None,
    };
    let resolver = symbolizer.as_ref().map(|s| StackResolver::new(s, memory_range));

    let mut sink = match &args.output {
        Some(path) => OutputSink::file(path)?,
        None => OutputSink::stdout(),
    };
    let mut stats = Statistics::new();

    if args.dry_run {
        info!("Dry run requested, detaching");
        return Ok(());
    }

    println!("===> Ready to trace queries");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            () = tokio::time::sleep(Duration::from_millis(100)) => {
                drain_ring(
                    &mut ring_buf,
                    &args,
                    &mut stats,
                    &mut sink,
                    resolver.as_ref(),
                    stack_traces.as_ref(),
                )?;
            }
        }
    }

    sink.flush()?;
    if args.statistics {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&stats.summary())?);
        } else {
            println!("{}", stats.render());
        }
    }
    Ok(())
}

/// Drain everything currently queued in the ring buffer.
fn drain_ring(
    ring_buf: &mut RingBuf<aya::maps::MapData>,
    args: &Args,
    stats: &mut Statistics,
    sink: &mut OutputSink,
    resolver: Option<&StackResolver<'_>>,
    stack_traces: Option<&StackTraceMap<aya::maps::MapData>>,
) -> Result<()> {
    while let Some(item) = ring_buf.next() {
        let Some(event) = parse(&item) else {
            warn!("Skipping undecodable record of {} bytes", item.len());
            continue;
        };

        // Per-pid filter; kinds above the global threshold always pass.
        let header = event.header();
        if !args.pids.contains(&(header.pid as i32)) && header.kind < GLOBAL_EVENT_THRESHOLD {
            continue;
        }

        let lock_wait_ns = stats.observe(&event);

        let frames;
        let stack = match (&event, resolver, stack_traces) {
            (Event::Lock(lock), Some(resolver), Some(map)) => {
                let id = StackId(lock.stack_id);
                if !id.is_captured() {
                    StackRender::None
                } else {
                    match resolver.resolve(id, map).context("stack trace lookup")? {
                        Some(resolved) => {
                            frames = resolved;
                            StackRender::Frames(&frames)
                        }
                        None => StackRender::Missing,
                    }
                }
            }
            _ => StackRender::None,
        };

        for line in render_event(args.json, &event, lock_wait_ns, &stack) {
            sink.line(&line)?;
        }
    }
    Ok(())
}
