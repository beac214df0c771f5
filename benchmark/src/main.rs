use anyhow::Context;
use clap::Parser;
use cpraft::{
    AtomicRefProxy, AtomicRefService, AtomicRefStateMachine, GroupId, LifecycleNotifier,
    LocalNetwork, RaftConfig, RaftGroupManager,
};
use hdrhistogram::Histogram;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of members in the group
    #[arg(short, long, default_value = "3")]
    members: u64,

    /// Number of concurrent clients
    #[arg(short, long, default_value = "1")]
    concurrency: usize,

    /// INTERVAL ms between submissions of one client
    #[arg(short, long, default_value = "0")]
    interval: u64,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value = "30")]
    duration: u64,

    /// Raft tick in milliseconds
    #[arg(short, long, default_value = "10")]
    tick: u64,
}

async fn start_group(args: &Args) -> anyhow::Result<(Vec<Arc<RaftGroupManager>>, AtomicRefProxy<u64>)> {
    let config = RaftConfig {
        tick_interval_ms: args.tick,
        ..Default::default()
    };
    let network = Arc::new(LocalNetwork::new());
    let members: Vec<u64> = (1..=args.members).collect();
    let group_id = GroupId::new("bench", 1);
    let mut managers = Vec::new();
    let mut services = Vec::new();
    for &member in &members {
        let manager = Arc::new(RaftGroupManager::new(
            member,
            config.clone(),
            network.clone(),
            Arc::new(LifecycleNotifier::new()),
        )?);
        services.push(AtomicRefService::new(&manager, Duration::from_secs(5)));
        manager.create_group(group_id.clone(), members.clone(), |_| {
            AtomicRefStateMachine::new()
        })?;
        managers.push(manager);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for (manager, service) in managers.iter().zip(&services) {
            let handle = manager.lookup(&group_id).context("group is gone")?;
            if handle.is_leader() {
                println!("Member {} leads the group", handle.member_id());
                return Ok((managers.clone(), service.atomic_ref("counter@bench")?));
            }
        }
        if Instant::now() > deadline {
            anyhow::bail!("no leader elected");
        }
        sleep(Duration::from_millis(args.tick)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let (managers, proxy) = start_group(&args).await?;

    let histogram = Arc::new(Mutex::new(Histogram::<u64>::new(3)?));
    let total_requests = Arc::new(Mutex::new(0u64));

    println!(
        "Starting benchmark with {} members, {} concurrent clients, INTERVAL: {}",
        args.members, args.concurrency, args.interval
    );

    let mut handles = Vec::new();
    for client in 0..args.concurrency {
        let proxy = proxy.clone();
        let histogram = histogram.clone();
        let total_requests = total_requests.clone();
        let interval = args.interval;
        let handle = tokio::spawn(async move {
            let mut value = client as u64;
            loop {
                let start = Instant::now();
                match proxy.set(&value).await {
                    Ok(()) => {
                        let duration = start.elapsed();
                        let mut hist = histogram.lock().await;
                        let _ = hist.record(duration.as_micros() as u64);
                        *total_requests.lock().await += 1;
                    }
                    Err(e) => eprintln!("Request failed: {}", e),
                }
                value += 1;
                if interval > 0 {
                    sleep(Duration::from_millis(interval)).await;
                }
            }
        });
        handles.push(handle);
    }

    // Run for specified duration
    sleep(Duration::from_secs(args.duration)).await;

    for handle in handles {
        handle.abort();
    }

    let total = *total_requests.lock().await;
    let hist = histogram.lock().await;

    println!("\nBenchmark Results:");
    println!("Total Requests: {}", total);
    println!("Average TPS: {:.2}", total as f64 / args.duration as f64);
    println!("\nLatency Distribution (microseconds):");
    println!("p50: {}", hist.value_at_percentile(50.0));
    println!("p90: {}", hist.value_at_percentile(90.0));
    println!("p95: {}", hist.value_at_percentile(95.0));
    println!("p99: {}", hist.value_at_percentile(99.0));
    println!("p99.9: {}", hist.value_at_percentile(99.9));

    for manager in managers {
        manager.shutdown().await;
    }
    Ok(())
}
