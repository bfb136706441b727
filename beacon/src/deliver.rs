//! beacon-deliver - send the pending queue to the collection endpoint
//!
//! One-shot mode runs the delivery worker until the queue drains or the
//! timeout elapses. Watch mode keeps delivering until Ctrl+C. Either way the
//! process owns the queue while it runs.

use anyhow::{bail, Context, Result};
use beacon_core::{Agent, Config, DeliveryStats, TestMode};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod process_lock;

use process_lock::QueueGuard;

#[derive(Parser)]
#[command(name = "beacon-deliver")]
#[command(about = "Deliver pending analytics events")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    /// Give up after this many milliseconds (one-shot mode)
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Watch mode - keep delivering until Ctrl+C
    #[arg(short, long)]
    watch: bool,
}

/// Poll interval for progress checks
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn main() -> Result<()> {
    let args = Args::parse();

    Config::ensure_xdg_env();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    if !config.collector.is_ready() && config.delivery.test_mode == TestMode::None {
        println!("Collector is not configured. Run 'beacon status' for details.");
        return Ok(());
    }

    let Some(_queue_guard) = QueueGuard::try_acquire(&Config::database_path())? else {
        bail!("failed to start beacon-deliver: another beacon process owns the queue");
    };

    let agent = Agent::open(&config).context("failed to open agent")?;
    agent.start().context("failed to start delivery")?;
    tracing::info!(pending = agent.pending_count(), "beacon-deliver starting");

    let result = if args.watch {
        run_watch_mode(&agent)
    } else {
        run_once(&agent, Duration::from_millis(args.timeout_ms))
    };

    agent.stop().context("failed to stop delivery")?;
    result
}

/// Deliver until the queue drains or the timeout elapses
fn run_once(agent: &Agent, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    let initial = agent.pending_count();

    if initial == 0 {
        println!("Nothing to deliver.");
        return Ok(());
    }

    println!("Delivering {} pending messages...", initial);

    while agent.pending_count() > 0 && start.elapsed() < timeout {
        thread::sleep(POLL_INTERVAL);
    }

    let stats = agent.stats();
    print_stats(&stats);

    let remaining = agent.pending_count();
    if remaining > 0 {
        bail!(
            "{} messages still pending after {}ms (server {})",
            remaining,
            timeout.as_millis(),
            if agent.server_available() {
                "available"
            } else {
                "unavailable"
            }
        );
    }

    println!("Delivery complete in {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}

/// Run continuous watch mode
fn run_watch_mode(agent: &Agent) -> Result<()> {
    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        eprintln!("\nShutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    println!(
        "Watch mode active ({} pending). Press Ctrl+C to stop.",
        agent.pending_count()
    );
    println!();

    let mut last = agent.stats();
    let mut available = agent.server_available();

    while running.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);

        let stats = agent.stats();
        let timestamp = chrono::Local::now().format("%H:%M:%S");

        if stats.messages_delivered > last.messages_delivered {
            println!(
                "[{}] Delivered: {} messages ({} pending)",
                timestamp,
                stats.messages_delivered - last.messages_delivered,
                agent.pending_count()
            );
        }

        let now_available = agent.server_available();
        if now_available != available {
            println!(
                "[{}] Server {}",
                timestamp,
                if now_available {
                    "available"
                } else {
                    "unavailable; probing"
                }
            );
            available = now_available;
        }

        last = stats;
    }

    println!("Watch mode stopped.");
    print_stats(&last);
    tracing::info!("beacon-deliver watch mode stopped");

    Ok(())
}

fn print_stats(stats: &DeliveryStats) {
    println!();
    println!("  Batches sent:       {}", stats.batches_sent);
    println!("  Batches failed:     {}", stats.batches_failed);
    println!("  Messages delivered: {}", stats.messages_delivered);
    println!("  Probes:             {}", stats.probes);
}
