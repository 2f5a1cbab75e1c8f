use autograder_common::redis;
use autograder_common::types::{RegradeRequest, RegradeResult};
use autograder_common::{telemetry, Config};
use autograder_grader::{
    handle_regrade, runner_from_config, Grader, GraderSettings, MemoryStore, RedisStore, SubmissionStore,
};
use autograder_jobs::LockManager;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();

    info!("Autograder worker booting...");

    let config = Config::from_env();
    info!(
        work_dir = %config.work_dir.display(),
        temp_dir = %config.temp_dir.display(),
        regrade_course_pool_size = config.regrade_course_pool_size,
        docker_disable = config.docker_disable,
        no_store = config.no_store,
        debug = config.debug,
        "Configuration loaded"
    );

    let client = ::redis::Client::open(config.redis_url.as_str())?;
    let mut redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", config.redis_url);

    let store: Arc<dyn SubmissionStore> = if config.no_store {
        warn!("NO_STORE set, submissions are kept in memory only");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::new(redis_conn.clone()))
    };
    let runner = runner_from_config(&config)?;
    let grader = Arc::new(Grader::new(
        Arc::new(LockManager::new()),
        runner,
        store,
        GraderSettings::from(&config),
    ));

    let shutdown_token = CancellationToken::new();
    let mut in_flight = JoinSet::new();

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => warn!("Received shutdown signal, stopping intake..."),
            Err(e) => {
                error!(error = %e, "Failed to install CTRL+C handler, running until killed");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = worker_loop(&mut redis_conn, &grader, &config, &shutdown_token, &mut in_flight) => result?,
        _ = shutdown => {},
    }

    shutdown_token.cancel();
    info!(in_flight = in_flight.len(), "Waiting for in-flight regrade requests");
    while in_flight.join_next().await.is_some() {}

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn worker_loop(
    redis_conn: &mut ::redis::aio::ConnectionManager,
    grader: &Arc<Grader>,
    config: &Config,
    shutdown: &CancellationToken,
    in_flight: &mut JoinSet<()>,
) -> anyhow::Result<()> {
    loop {
        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Regrade request task panicked");
            }
        }

        // BLPOP with timeout so shutdown is noticed between requests
        match redis::pop_regrade_request(redis_conn, config.queue_timeout_secs).await {
            Ok(Some(request)) => {
                info!(
                    request_id = %request.id,
                    course = %request.assignment.course_id,
                    assignment = %request.assignment.id,
                    selectors = ?request.selectors,
                    wait = request.wait_for_completion,
                    requested_by = request.requested_by.as_deref().unwrap_or(""),
                    "Received regrade request"
                );

                // Requests for different courses proceed in parallel; the
                // course lock serializes the rest
                in_flight.spawn(process_request(
                    grader.clone(),
                    redis_conn.clone(),
                    request,
                    shutdown.child_token(),
                ));
            }
            Ok(None) => {
                debug!("Queue idle");
                continue;
            }
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }
    }
}

#[instrument(skip_all, fields(request_id = %request.id))]
async fn process_request(
    grader: Arc<Grader>,
    mut redis_conn: ::redis::aio::ConnectionManager,
    request: RegradeRequest,
    cancel: CancellationToken,
) {
    let start = Instant::now();

    let result = match handle_regrade(&grader, &request, cancel).await {
        Ok(result) => {
            info!(
                users = result.users.len(),
                regraded = result.results.values().filter(|r| r.is_some()).count(),
                pending = result.pending,
                execution_ms = start.elapsed().as_millis() as u64,
                "Regrade request handled"
            );
            result
        }
        Err(e) => {
            error!(error = %e, "Regrade request failed");
            RegradeResult {
                request_id: request.id,
                users: Vec::new(),
                results: HashMap::new(),
                pending: 0,
                error: Some(e.to_string()),
                completed_at: Utc::now(),
            }
        }
    };

    match redis::store_regrade_result(&mut redis_conn, &result).await {
        Ok(()) => info!("Regrade result persisted to Redis"),
        // Non-fatal, the worker keeps going
        Err(e) => error!(error = %e, "Failed to persist regrade result"),
    }
}
