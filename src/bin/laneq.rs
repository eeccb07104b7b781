//! laneq CLI: inspect configuration and exercise the scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand};
use laneq::config::Config;
use laneq::event::log_events;
use laneq::model::{EnqueueOptions, Item};
use laneq::registry::handler_fn;
use laneq::scheduler::Scheduler;
use laneq::telemetry::{TelemetryConfig, init_telemetry};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "laneq", about = "Named-lane job scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective scheduler configuration as TOML
    Config,
    /// Run synthetic work through the scheduler and report final states
    Simulate {
        /// Items to enqueue per lane
        #[arg(long, default_value_t = 10)]
        items: u64,
        /// Comma-separated lane names
        #[arg(long, value_delimiter = ',', default_value = "content,social")]
        lanes: Vec<String>,
        /// Every Nth item fails its first attempt (0 = never)
        #[arg(long, default_value_t = 3)]
        flaky_every: u64,
        /// Every Nth item never settles and times out (0 = never)
        #[arg(long, default_value_t = 0)]
        hang_every: u64,
        /// Simulated handler latency
        #[arg(long, default_value_t = 20)]
        handler_ms: u64,
        /// Override the per-lane concurrency cap
        #[arg(long)]
        max_concurrent: Option<usize>,
        /// Override the default per-item timeout
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 60)]
        deadline_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command {
        Command::Config => {
            print!("{}", config.scheduler.to_toml_string()?);
            Ok(())
        }
        Command::Simulate {
            items,
            lanes,
            flaky_every,
            hang_every,
            handler_ms,
            max_concurrent,
            timeout_ms,
            deadline_secs,
        } => {
            if let Some(n) = max_concurrent {
                config.scheduler.max_concurrent = n;
            }
            if let Some(ms) = timeout_ms {
                config.scheduler.default_timeout_ms = ms;
            }
            let _guard = init_telemetry(TelemetryConfig::from_config(&config, "laneq"))?;

            let plan = Plan {
                flaky_every,
                hang_every,
                latency: Duration::from_millis(handler_ms),
            };
            let settled = cmd_simulate(
                config,
                &lanes,
                items,
                plan,
                Duration::from_secs(deadline_secs),
            )
            .await?;
            print_summary(&settled);
            Ok(())
        }
    }
}

#[derive(Clone, Copy)]
struct Plan {
    flaky_every: u64,
    hang_every: u64,
    latency: Duration,
}

impl Plan {
    fn hits(every: u64, n: u64) -> bool {
        every > 0 && n % every == 0
    }
}

async fn cmd_simulate(
    config: Config,
    lanes: &[String],
    items: u64,
    plan: Plan,
    deadline: Duration,
) -> anyhow::Result<Vec<Item>> {
    let scheduler = Scheduler::new(config.scheduler)?;
    tokio::spawn(log_events(scheduler.subscribe()));
    let mut rx = scheduler.subscribe();

    for lane in lanes {
        let calls: Arc<Mutex<HashMap<u64, u32>>> = Arc::default();
        scheduler.register_processor(
            lane,
            handler_fn(move |payload| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = payload["n"].as_u64().unwrap_or(0);
                    let attempt = {
                        let mut calls = calls.lock().unwrap_or_else(|e| e.into_inner());
                        let c = calls.entry(n).or_insert(0);
                        *c += 1;
                        *c
                    };
                    if Plan::hits(plan.hang_every, n) {
                        return std::future::pending().await;
                    }
                    tokio::time::sleep(plan.latency).await;
                    if Plan::hits(plan.flaky_every, n) && attempt == 1 {
                        anyhow::bail!("simulated transient failure for item {n}");
                    }
                    Ok(json!({ "n": n, "attempt": attempt }))
                }
            }),
        );
    }

    let total = lanes.len() as u64 * items;
    for n in 1..=items {
        for lane in lanes {
            scheduler.enqueue(lane, json!({ "n": n }), EnqueueOptions::new())?;
        }
    }

    let mut settled = Vec::new();
    let collect = async {
        while (settled.len() as u64) < total {
            match rx.recv().await {
                Ok(event) if event.kind.is_settlement() => {
                    if let Some(item) = event.kind.item() {
                        settled.push(item.clone());
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    anyhow::bail!("summary lost {skipped} events; raise event_capacity")
                }
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    };
    let outcome = tokio::time::timeout(deadline, collect).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => tracing::warn!(
            settled = settled.len(),
            total,
            "deadline reached before every item settled"
        ),
    }

    for lane in lanes {
        let stats = scheduler.stats(lane);
        tracing::info!(
            queue = %lane,
            pending = stats.pending,
            processing = stats.processing,
            failed = stats.failed,
            "lane state after simulation"
        );
    }
    Ok(settled)
}

fn print_summary(items: &[Item]) {
    println!(
        "{:<36}  {:<10}  {:<10}  {:<8}  ERROR",
        "ID", "QUEUE", "STATUS", "ATTEMPTS"
    );
    println!("{}", "-".repeat(100));
    for item in items {
        let error = item
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10}  {:<10}  {:<8}  {}",
            item.id, item.queue_name, item.status, item.attempts, error
        );
    }
    let attempts: u32 = items.iter().map(|i| i.attempts).sum();
    println!("\n{} item(s), {attempts} attempt(s)", items.len());
}
