use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use judge_pipeline::achievements::{AchievementCatalog, AchievementEvaluator};
use judge_pipeline::config::AppConfig;
use judge_pipeline::harness::StoredHarness;
use judge_pipeline::heartbeat::{HeartbeatStore, RedisHeartbeats};
use judge_pipeline::intake::SubmissionService;
use judge_pipeline::notifications::{NotificationBus, RedisPublisher};
use judge_pipeline::queue::{JobQueue, RedisJobQueue};
use judge_pipeline::queue_health::QueueHealthService;
use judge_pipeline::rate_limit::{CounterStore, RateLimitScope, RateLimiter, RedisCounters};
use judge_pipeline::reaper::Reaper;
use judge_pipeline::redis_manager::RedisManager;
use judge_pipeline::sandbox::PistonClient;
use judge_pipeline::server::{self, AppState};
use judge_pipeline::store::postgres::Database;
use judge_pipeline::store::Repository;
use judge_pipeline::worker::SubmissionWorker;

/// Extra time granted on top of the worker drain before tasks are abandoned
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_pipeline=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    info!("Starting judge pipeline (role={:?})", config.role);

    let redis = RedisManager::connect(&config.redis_url).await?;
    let database = Database::connect(&config.database_url, config.database_max_connections).await?;
    info!("Connected to PostgreSQL");

    let repo: Arc<dyn Repository> = Arc::new(database);
    let queue: Arc<dyn JobQueue> =
        Arc::new(RedisJobQueue::new(redis.clone(), config.queue_poll_timeout));
    let heartbeats: Arc<dyn HeartbeatStore> = Arc::new(RedisHeartbeats::new(redis.connection()));

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

    if config.role.runs_worker() {
        let sandbox = Arc::new(PistonClient::new(config.sandbox.clone())?);
        info!("Sandbox endpoint: {}", config.sandbox.base_url);

        let catalog = AchievementCatalog::builtin()?;
        info!("Loaded {} achievement definitions", catalog.len());
        let evaluator = Arc::new(AchievementEvaluator::new(
            queue.clone(),
            repo.clone(),
            Arc::new(RedisPublisher::new(redis.connection())),
            catalog,
        ));
        evaluator.seed().await?;

        let worker = Arc::new(SubmissionWorker::new(
            queue.clone(),
            repo.clone(),
            sandbox,
            heartbeats.clone(),
            config.worker.clone(),
        ));
        let reaper = Reaper::new(queue.clone(), repo.clone(), config.reaper.clone());

        let token = cancel.clone();
        tasks.spawn(async move { ("worker", worker.start(token).await) });
        let token = cancel.clone();
        tasks.spawn(async move { ("achievements", evaluator.run(token).await) });
        let token = cancel.clone();
        tasks.spawn(async move {
            reaper.run(token).await;
            ("reaper", Ok(()))
        });
    }

    if config.role.runs_server() {
        let counters: Arc<dyn CounterStore> = Arc::new(RedisCounters::new(redis.connection()));
        let submissions = SubmissionService::new(
            repo.clone(),
            queue.clone(),
            Arc::new(StoredHarness),
            RateLimiter::new(counters.clone(), RateLimitScope::Submission, config.submit_limit),
            RateLimiter::new(counters, RateLimitScope::Run, config.run_limit),
        );
        let notifications = NotificationBus::new();
        let state = Arc::new(AppState {
            submissions,
            queue_health: QueueHealthService::new(queue.clone(), repo.clone(), heartbeats.clone()),
            notifications: notifications.clone(),
            shutdown: cancel.clone(),
        });

        let client = redis.client().clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            notifications.listen_loop(client, token).await;
            ("notifications", Ok(()))
        });
        let bind = config.http_bind.clone();
        let token = cancel.clone();
        tasks.spawn(async move { ("http", server::serve(&bind, state, token).await) });
    }

    // Run until a signal arrives or any long-lived task exits on its own.
    tokio::select! {
        _ = shutdown_signal() => {}
        Some(joined) = tasks.join_next() => {
            report(joined);
            warn!("A pipeline task exited early, shutting down");
        }
    }
    cancel.cancel();

    let deadline = config.worker.drain_timeout + SHUTDOWN_GRACE;
    let drained = tokio::time::timeout(deadline, async {
        while let Some(joined) = tasks.join_next().await {
            report(joined);
        }
    })
    .await;
    if drained.is_err() {
        warn!("Tasks still running after {:?}, aborting", deadline);
        tasks.abort_all();
    }

    info!("Judge pipeline stopped");
    Ok(())
}

fn report(joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>) {
    match joined {
        Ok((name, Ok(()))) => info!("{} stopped", name),
        Ok((name, Err(e))) => error!("{} failed: {:#}", name, e),
        Err(e) => error!("Pipeline task panicked: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT, shutting down");
    }
}
