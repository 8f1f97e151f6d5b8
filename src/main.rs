mod cli;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, RunArgs};
use dimex::checker::{load_snapshot_dir, Checker};
use dimex::config::NodeConfig;
use dimex::dmx::{DmxNode, FileSnapshotStore};
use dimex::net::TcpLink;
use dimex::runner::{spawn_node, DmxHandle};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let result = match cli.command {
        Commands::Run(args) => run(args),
        Commands::Analyze { snapshot_dir } => analyze(&snapshot_dir).map(|passed| {
            if !passed {
                process::exit(1);
            }
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = NodeConfig::new(args.id, args.addresses, &args.snapshot_dir)?;

    let (link, inbox) = TcpLink::start(config.node_id, &config.addresses)
        .with_context(|| format!("failed to listen on {}", config.own_address()))?;
    let store = FileSnapshotStore::new(&config.snapshot_dir, config.node_id);
    let node = DmxNode::with_sink(link, Box::new(store))?;
    let handle = Arc::new(spawn_node(node, inbox).context("failed to spawn node thread")?);

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.shared_file)
        .with_context(|| format!("failed to open {}", args.shared_file.display()))?;

    info!(
        node = config.node_id,
        processes = config.process_count(),
        file = %args.shared_file.display(),
        "Waiting for peers"
    );
    thread::sleep(Duration::from_millis(args.startup_delay_ms));

    if args.snapshot_every_ms > 0 {
        spawn_snapshot_timer(handle.clone(), Duration::from_millis(args.snapshot_every_ms))?;
    }

    let hold = Duration::from_millis(args.hold_ms);
    let pause = Duration::from_millis(args.pause_ms);
    let mut round = 0u64;
    while args.rounds.map_or(true, |limit| round < limit) {
        handle.acquire()?;

        file.write_all(b"|")?;
        info!(node = config.node_id, round, "In critical section");
        thread::sleep(hold);
        file.write_all(b".")?;
        file.flush()?;

        handle.exit()?;
        info!(node = config.node_id, round, "Out of critical section");
        thread::sleep(pause);
        round += 1;
    }

    info!(node = config.node_id, rounds = round, linger_ms = args.linger_ms, "Rounds complete");
    thread::sleep(Duration::from_millis(args.linger_ms));
    Ok(())
}

fn spawn_snapshot_timer(handle: Arc<DmxHandle>, every: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("dimex-snapshots".to_string())
        .spawn(move || loop {
            if let Err(e) = handle.snapshot() {
                warn!(error = %e, "Snapshot timer stopping");
                return;
            }
            thread::sleep(every);
        })
        .context("failed to spawn snapshot timer")?;
    Ok(())
}

/// Print one line per snapshot. Returns false if any invariant failed.
fn analyze(dir: &Path) -> anyhow::Result<bool> {
    let snapshots = load_snapshot_dir(dir)?;
    if snapshots.is_empty() {
        println!("No snapshots in {}", dir.display());
        return Ok(true);
    }

    let results = Checker::new().check_all(&snapshots);
    let mut failed = 0;
    let mut incomplete = 0;
    for result in &results {
        let s = &result.stats;
        if !result.complete {
            incomplete += 1;
            println!(
                "snapshot {:>6}: INCOMPLETE ({} records)",
                result.snapshot_id, s.processes
            );
            continue;
        }
        let verdict = if result.passed { "OK" } else { "VIOLATED" };
        println!(
            "snapshot {:>6}: {} (in access {}, wanting {}, deferred {}, in flight {})",
            result.snapshot_id, verdict, s.in_access, s.wants_access, s.deferred, s.in_flight
        );
        for v in &result.violations {
            println!("    [{}] {}", v.kind, v.description);
        }
        if !result.passed {
            failed += 1;
        }
    }

    println!(
        "{} snapshots, {} incomplete, {} violated",
        results.len(),
        incomplete,
        failed
    );
    Ok(failed == 0)
}
