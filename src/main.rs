//! bulkmove - Parallel tree walker, bulk copier and replicator
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use bulkmove::backend::LocalBackend;
use bulkmove::config::{CliArgs, CliCommand, DispatchConfig, ReplicateConfig, WalkConfig};
use bulkmove::copy::{CopyPolicy, TreeCopy};
use bulkmove::dispatch::{Command, TaskDispatcher, TaskStatus, STOP_TIMEOUT};
use bulkmove::progress::{
    print_copy_summary, print_header, print_replicate_summary, print_walk_summary, ProgressReporter,
};
use bulkmove::replicate::Replicator;
use bulkmove::walker::{DirTreeWalker, CLOSE_TIMEOUT};
use bulkmove::Engine;
use clap::Parser;
use std::io::{self, BufWriter, Write};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Entries between progress refreshes
const PROGRESS_EVERY: u64 = 1000;

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the run finished without failures
fn run() -> Result<bool> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    match &args.command {
        CliCommand::List(list) => {
            let config = WalkConfig::from_args(&list.walk, list.recursive, args.quiet, args.verbose)
                .context("Invalid configuration")?;
            run_list(config)
        }
        CliCommand::Copy(copy) => {
            let config = DispatchConfig::from_args(copy, args.quiet, args.verbose)
                .context("Invalid configuration")?;
            run_copy(config)
        }
        CliCommand::Replicate(rep) => {
            let config = ReplicateConfig::from_args(rep, args.quiet, args.verbose)
                .context("Invalid configuration")?;
            run_replicate(config)
        }
    }
}

/// Walk and print one line per entry
fn run_list(config: WalkConfig) -> Result<bool> {
    let engine = Engine::new(LocalBackend::new());
    let mut walker = DirTreeWalker::open(
        &engine,
        &config.src.path,
        None,
        config.worker_count,
        config.queue_size,
        config.recursive,
    )
    .context("Failed to initialize walker")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let walk_control = walker.controller();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
        walk_control.terminate(CLOSE_TIMEOUT);
    })
    .context("Failed to set signal handler")?;

    let progress = config.show_progress.then(ProgressReporter::new);
    let started = Instant::now();
    walker.start().context("Failed to start walker")?;

    let mut out = BufWriter::new(io::stdout().lock());
    let mut seen = 0u64;
    while let Some(entry) = walker.next() {
        seen += 1;
        if let Some(p) = &progress {
            if seen % PROGRESS_EVERY == 0 {
                p.update_walk(&walker.stats());
            }
        }
        if config.is_excluded(&entry.subpath) {
            continue;
        }
        writeln!(
            out,
            "{}\t{}\t{}\t{}",
            entry.src.entry_type,
            entry.src.size,
            entry.src.mtime.sec,
            entry.path_under(walker.src_root())
        )
        .context("Failed to write listing")?;
    }
    out.flush().context("Failed to write listing")?;

    let stats = walker.stats();
    walker.close().context("Walk failed")?;

    let interrupted = interrupted.load(Ordering::SeqCst);
    if let Some(p) = &progress {
        p.finish(if interrupted { "Walk interrupted" } else { "Walk completed" });
        print_walk_summary(&stats, started.elapsed());
    }
    if stats.errors > 0 {
        info!(errors = stats.errors, "Walk completed with errors");
    }
    Ok(!interrupted && stats.errors == 0)
}

/// Walk the source with the destination resolved, mirror directories and
/// symlinks, and hand every regular file that needs copying to the dispatcher
fn run_copy(config: DispatchConfig) -> Result<bool> {
    let engine = Engine::new(LocalBackend::new());
    let src_root = config.walk.src.path.clone();

    if config.walk.show_progress {
        let dst = config.dst.to_string();
        print_header(&config.walk.src.to_string(), Some(&dst), config.worker_count);
    }

    let policy = CopyPolicy {
        force: config.force,
        skip_existing: config.skip_existing,
        simulate: config.simulate_rate > 0,
    };
    let mut tree = TreeCopy::new(&engine, &src_root, &config.dst.path, policy)
        .with_context(|| format!("Cannot prepare {}", config.dst.path))?;
    debug!(dst = %tree.dst_root(), "Destination resolved");

    let mut walker = DirTreeWalker::open(
        &engine,
        &src_root,
        Some(tree.dst_root()),
        config.walk.worker_count,
        config.walk.queue_size,
        true,
    )
    .context("Failed to initialize walker")?;

    let mut dispatcher = TaskDispatcher::start(
        &engine,
        config.options(),
        |dst: &String| debug!(path = %dst, "Copy started"),
        |status, dst: String| match status {
            TaskStatus::Ok | TaskStatus::Skipped => debug!(path = %dst, %status, "Copy done"),
            _ => warn!(path = %dst, %status, "Copy failed"),
        },
    )
    .context("Failed to start dispatcher")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let walk_control = walker.controller();
    let copy_control = dispatcher.controller();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
        walk_control.terminate(CLOSE_TIMEOUT);
        copy_control.terminate(STOP_TIMEOUT);
    })
    .context("Failed to set signal handler")?;

    let progress = config.walk.show_progress.then(ProgressReporter::new);
    let started = Instant::now();
    walker.start().context("Failed to start walker")?;

    let mut seen = 0u64;
    while let Some(entry) = walker.next() {
        if dispatcher.is_stopping() {
            break;
        }
        seen += 1;
        if let Some(p) = &progress {
            if seen % PROGRESS_EVERY == 0 {
                p.update_copy(&walker.stats(), &dispatcher.stats());
            }
        }
        if config.walk.is_excluded(&entry.subpath) {
            continue;
        }
        if let Some(copy) = tree.prepare(&entry) {
            let dst = copy.dst.clone();
            dispatcher
                .submit(Command::Copy(copy), dst)
                .context("Failed to queue copy")?;
        }
    }

    let walk_stats = walker.stats();
    walker.close().context("Walk failed")?;
    dispatcher.join().context("Copy failed")?;
    let copy_stats = dispatcher.stats();
    let tree_stats = tree.stats();

    let interrupted = interrupted.load(Ordering::SeqCst);
    if let Some(p) = &progress {
        p.finish_and_clear();
    }
    if config.walk.show_progress {
        print_copy_summary(&walk_stats, &copy_stats, &tree_stats, started.elapsed(), interrupted);
    }

    let failed = copy_stats.failed + copy_stats.fatal + copy_stats.busy + tree_stats.failures;
    Ok(!interrupted && failed == 0 && walk_stats.errors == 0)
}

/// Walk the tree and bring every file's replicas to the requested placement
fn run_replicate(config: ReplicateConfig) -> Result<bool> {
    let engine = Engine::new(LocalBackend::new());
    let root = config.walk.src.path.clone();

    if config.walk.show_progress {
        print_header(&config.walk.src.to_string(), None, config.worker_count);
    }

    let mut replicator = Replicator::new(&engine, &root, config.plan.clone())
        .context("Failed to select hosts")?;
    let mut walker = DirTreeWalker::open(
        &engine,
        &root,
        None,
        config.walk.worker_count,
        config.walk.queue_size,
        true,
    )
    .context("Failed to initialize walker")?;
    let mut dispatcher = replicator
        .start_dispatcher(&engine, config.options())
        .context("Failed to start dispatcher")?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    let walk_control = walker.controller();
    let rep_control = dispatcher.controller();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
        walk_control.terminate(CLOSE_TIMEOUT);
        rep_control.terminate(STOP_TIMEOUT);
    })
    .context("Failed to set signal handler")?;

    let progress = config.walk.show_progress.then(ProgressReporter::new);
    if let Some(p) = &progress {
        p.set_status("Scheduling replicas");
    }
    let started = Instant::now();
    walker.start().context("Failed to start walker")?;

    replicator
        .schedule(&walker, &dispatcher, |subpath| config.walk.is_excluded(subpath))
        .context("Failed to queue replication")?;

    let walk_stats = walker.stats();
    walker.close().context("Walk failed")?;
    dispatcher.join().context("Replication failed")?;
    let stats = replicator.finish();

    let interrupted = interrupted.load(Ordering::SeqCst);
    if let Some(p) = &progress {
        p.finish_and_clear();
    }
    if config.walk.show_progress {
        print_replicate_summary(&walk_stats, &stats, started.elapsed(), interrupted);
    }
    if stats.failures() > 0 {
        info!(failures = stats.failures(), "Replication completed with errors");
    }

    Ok(!interrupted && stats.failures() == 0 && walk_stats.errors == 0)
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("bulkmove=debug,warn")
    } else {
        EnvFilter::new("bulkmove=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(io::stderr)
        .init();

    Ok(())
}
