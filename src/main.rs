use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bucketd::config::{CoordinatorConfig, ServiceConfig, ServiceKind};
use bucketd::distributor::UniformDistributor;
use bucketd::election::InMemoryElection;
use bucketd::manager::{BucketManager, NoopWorker, SharedBucketManager};
use bucketd::store::InMemoryCoordination;

/// Run a simulated controller fleet coordinating bucket ownership over the
/// in-process substrate.
#[derive(Parser, Debug)]
#[command(name = "bucketd")]
#[command(version)]
#[command(about = "Bucket ownership coordination simulator")]
struct Args {
    /// Number of simulated controller processes
    #[arg(long, default_value = "3")]
    processes: usize,

    /// Number of buckets to partition across the fleet
    #[arg(long, default_value = "16")]
    buckets: u32,

    /// Minimum seconds between rebalance passes within a leadership tenure
    #[arg(long, default_value = "0")]
    min_rebalance_interval: u64,

    /// Randomly crash and restart processes at this interval in seconds
    /// (0 disables churn)
    #[arg(long, default_value = "0")]
    churn_interval: u64,
}

async fn spawn_process(
    coordination: &InMemoryCoordination,
    election: &InMemoryElection,
    interval: Duration,
) -> SharedBucketManager {
    let process_id = format!("controller-{}", Uuid::new_v4());
    let config = CoordinatorConfig::new(process_id.clone())
        .with_min_rebalance_interval(interval);
    let manager = Arc::new(BucketManager::new(
        coordination.service().clone(),
        config,
        Arc::new(coordination.clone()),
        Arc::new(coordination.clone()),
        Arc::new(coordination.clone()),
        Arc::new(election.participant(&process_id)),
        Arc::new(UniformDistributor),
        Arc::new(NoopWorker),
    ));
    manager.clone().start().await.expect("manager startup");
    coordination.join(&process_id).await;
    tracing::info!(process = %process_id, "Controller process joined the fleet");
    manager
}

/// Resolves on SIGTERM or SIGINT. The fleet is then stopped through
/// [`BucketManager::stop`] so leadership is released rather than reclaimed
/// by timeout.
async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let service = ServiceConfig::new(ServiceKind::Retention, args.buckets);
    let interval = Duration::from_secs(args.min_rebalance_interval);

    let coordination = InMemoryCoordination::new(service);
    let election = InMemoryElection::new(ServiceKind::Retention);

    let mut fleet = Vec::new();
    for _ in 0..args.processes {
        fleet.push(spawn_process(&coordination, &election, interval).await);
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut report = tokio::time::interval(Duration::from_secs(5));
    let mut churn = tokio::time::interval(Duration::from_secs(
        if args.churn_interval == 0 { 3600 } else { args.churn_interval },
    ));
    churn.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = report.tick() => {
                let owners = coordination.marker_owners().await;
                tracing::info!(
                    owned = owners.len(),
                    total = args.buckets,
                    fleet = fleet.len(),
                    "Ownership status"
                );
            }
            _ = churn.tick(), if args.churn_interval > 0 => {
                let mut rng = rand::thread_rng();
                if fleet.len() > 1 && rng.gen_bool(0.5) {
                    let index = rng.gen_range(0..fleet.len());
                    let manager = fleet.swap_remove(index);
                    tracing::info!(process = %manager.process_id(), "Churn: crashing process");
                    coordination.leave(manager.process_id()).await;
                    manager.stop().await;
                } else {
                    tracing::info!("Churn: starting a new process");
                    fleet.push(spawn_process(&coordination, &election, interval).await);
                }
                fleet.shuffle(&mut rng);
            }
        }
    }

    for manager in fleet {
        coordination.leave(manager.process_id()).await;
        manager.stop().await;
    }
    tracing::info!("Fleet stopped");
}
