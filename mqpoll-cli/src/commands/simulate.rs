//! Simulate command
//!
//! Opens a set of in-memory queues, registers one retrieval per queue and
//! feeds them from a producer task. Every delivery and terminal condition is
//! printed as it arrives, followed by a per-queue summary.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use mqpoll_client::{MemoryTransport, RetrievalError, Scheduler, handler_fn};
use mqpoll_core::domain::handle::{ConnectionHandle, ObjectHandle};
use mqpoll_core::domain::message::{GetOptions, MessageDescriptor, WaitInterval};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::TuningArgs;

/// Simulation parameters
#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    /// Number of queues to open
    #[arg(long, env = "MQPOLL_SIM_QUEUES", default_value_t = 3)]
    pub queues: usize,

    /// Messages produced per queue
    #[arg(long, env = "MQPOLL_SIM_MESSAGES", default_value_t = 20)]
    pub messages: usize,

    /// Delay between producer rounds
    #[arg(long, env = "MQPOLL_SIM_RATE_MS", default_value_t = 100)]
    pub rate_ms: u64,

    /// Wait budget per retrieval; unlimited when omitted
    #[arg(long, env = "MQPOLL_SIM_WAIT_MS")]
    pub wait_ms: Option<u64>,

    /// Largest payload the producer puts
    #[arg(long, env = "MQPOLL_SIM_MAX_PAYLOAD", default_value_t = 32 * 1024)]
    pub max_payload: usize,

    /// Stop after this long even if retrievals are still waiting
    #[arg(long, env = "MQPOLL_SIM_DURATION_SECS", default_value_t = 30)]
    pub duration_secs: u64,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

enum Event {
    Delivered { queue: usize, bytes: usize },
    Ended { queue: usize, error: RetrievalError },
}

#[derive(Default)]
struct Tally {
    delivered: usize,
    bytes: usize,
    ended: Option<RetrievalError>,
}

/// Runs the simulation
pub async fn run(args: SimulateArgs) -> Result<()> {
    let tuning = args.tuning.resolve()?;
    let transport = Arc::new(MemoryTransport::new());
    let scheduler = Scheduler::new(transport.clone(), tuning.clone())
        .context("Failed to create scheduler")?;

    let conn = transport.connect(
        scheduler
            .connect_options()
            .with_application_name("mqpoll simulate"),
    );
    info!("Connected {} ({:?})", conn, tuning.handle_share_mode);

    let names: Vec<String> = (0..args.queues)
        .map(|i| format!("MQPOLL.SIM.{}", i))
        .collect();
    let mut objects = Vec::with_capacity(names.len());
    for name in &names {
        let object = transport
            .open(conn, name)
            .with_context(|| format!("Failed to open {}", name))?;
        objects.push(object);
    }

    let options = match args.wait_ms {
        Some(ms) => GetOptions::waiting(WaitInterval::Millis(ms)),
        None => GetOptions::waiting(WaitInterval::Unlimited),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (queue, object) in objects.iter().enumerate() {
        let tx = tx.clone();
        scheduler.register_retrieval(
            conn,
            *object,
            MessageDescriptor::default(),
            options.clone(),
            handler_fn(move |result| {
                let event = match result {
                    Ok(delivery) => Event::Delivered {
                        queue,
                        bytes: delivery.payload.len(),
                    },
                    Err(error) => Event::Ended { queue, error },
                };
                let _ = tx.send(event);
            }),
        );
    }
    drop(tx);

    println!(
        "{}",
        format!(
            "Simulating {} queue(s), {} message(s) each, every {} ms",
            args.queues, args.messages, args.rate_ms
        )
        .bold()
    );
    println!();

    let producer = tokio::spawn(produce(
        Arc::clone(&transport),
        conn,
        objects.clone(),
        args.messages,
        Duration::from_millis(args.rate_ms),
        args.max_payload.max(1),
    ));

    let mut tallies: Vec<Tally> = names.iter().map(|_| Tally::default()).collect();
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                record(&mut tallies, &names, event);
                if tallies.iter().all(|t| t.ended.is_some()) {
                    info!("Every retrieval has ended");
                    break;
                }
            }
            _ = &mut deadline => {
                info!("Simulation time is up");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    producer.abort();
    let stats = scheduler.stats();
    let cancelled = scheduler.cancel_all();
    debug!("Cancelled {} outstanding retrieval(s)", cancelled);

    print_summary(&names, &tallies);
    println!(
        "{}",
        format!(
            "Delivered {}, timed out {}, failed {}",
            stats.delivered, stats.timeouts, stats.failures
        )
        .dimmed()
    );

    Ok(())
}

/// Puts one message on every queue per round
async fn produce(
    transport: Arc<MemoryTransport>,
    conn: ConnectionHandle,
    objects: Vec<ObjectHandle>,
    messages: usize,
    rate: Duration,
    max_payload: usize,
) {
    for round in 0..messages {
        for (queue, object) in objects.iter().enumerate() {
            // Spread sizes so buffers both grow and shrink
            let size = 1 + (round * 7919 + queue * 104_729) % max_payload;
            let payload = vec![b'x'; size];
            if let Err(e) = transport.put(conn, *object, MessageDescriptor::default(), payload) {
                debug!("Producer stopped: {}", e);
                return;
            }
        }
        tokio::time::sleep(rate).await;
    }
    debug!("Producer finished after {} round(s)", messages);
}

fn record(tallies: &mut [Tally], names: &[String], event: Event) {
    match event {
        Event::Delivered { queue, bytes } => {
            let tally = &mut tallies[queue];
            tally.delivered += 1;
            tally.bytes += bytes;
            println!("  {} {} {} bytes", "▸".cyan(), names[queue].bold(), bytes);
        }
        Event::Ended { queue, error } => {
            let line = format!("  {} {} {}", "■".cyan(), names[queue].bold(), error);
            if error.is_timeout() {
                println!("{}", line.yellow());
            } else {
                println!("{}", line.red());
            }
            tallies[queue].ended = Some(error);
        }
    }
}

fn print_summary(names: &[String], tallies: &[Tally]) {
    println!();
    println!("{}", "Summary:".bold());
    for (name, tally) in names.iter().zip(tallies) {
        let status = match &tally.ended {
            None => "waiting".green(),
            Some(e) if e.is_timeout() => "timed out".yellow(),
            Some(_) => "failed".red(),
        };
        println!(
            "  {:<16} {:>5} message(s) {:>10} bytes   {}",
            name, tally.delivered, tally.bytes, status
        );
    }
    println!();
}
