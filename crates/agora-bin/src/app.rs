//! Service wiring: store, broker, relay and lifecycle.

use agora_broker::{AmqpBroker, AmqpConfig, Broker, ConsumerSpec, EventHandler};
use agora_config::Config;
use agora_lifecycle::{LifecycleManager, ShutdownSummary};
use agora_outbox::PgOutboxStore;
use agora_relay::{RelayConfig, RelayLoop};
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Consumer specs paired with their handlers. Defined at process start;
/// topology is derived from them before anything subscribes.
pub type Consumers = Vec<(ConsumerSpec, Arc<dyn EventHandler>)>;

/// Run until interrupted, then shut everything down gracefully.
pub async fn run(config: Config, consumers: Consumers) -> anyhow::Result<ShutdownSummary> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to the outbox database")?;
    let store = PgOutboxStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("ensuring the outbox schema")?;

    let specs: Vec<ConsumerSpec> = consumers.iter().map(|(spec, _)| spec.clone()).collect();
    let broker = Arc::new(AmqpBroker::new(
        AmqpConfig {
            uri: config.broker_url.clone(),
            consumer_prefetch: config.consumer_prefetch,
            ..AmqpConfig::default()
        },
        &specs,
    ));
    broker.init().await.context("initializing the broker")?;

    let lifecycle = Arc::new(LifecycleManager::with_timeout(Duration::from_secs(
        config.shutdown_timeout_secs,
    )));

    for (spec, handler) in consumers {
        let name = spec.name.clone();
        let handle = broker
            .subscribe(spec, handler)
            .await
            .with_context(|| format!("subscribing consumer {name}"))?;
        lifecycle.register(format!("consumer:{name}"), Box::new(move || {
            Box::pin(async move {
                handle.stop().await;
                Ok(())
            })
        }))?;
    }

    let relay = RelayLoop::new(
        Arc::new(store),
        broker.clone(),
        lifecycle.clone(),
        RelayConfig {
            prefetch: config.relay_prefetch,
            poll_interval: Duration::from_millis(config.relay_poll_interval_ms),
            initial_backoff: Duration::from_millis(config.relay_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.relay_max_backoff_ms),
            backlog_warn_threshold: config.backlog_warn_threshold,
            ..RelayConfig::default()
        },
    );
    let relay_task = tokio::spawn(relay.run());
    lifecycle.register("relay", Box::new(move || {
        Box::pin(async move {
            // The relay observes the shutdown flag between iterations; wait
            // for it to finish its current one.
            relay_task.await.map_err(anyhow::Error::from)
        })
    }))?;

    let shutdown_broker = broker.clone();
    lifecycle.register("broker", Box::new(move || {
        Box::pin(async move {
            shutdown_broker.shutdown().await.map_err(anyhow::Error::from)
        })
    }))?;

    info!("agora-eventd running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    let summary = lifecycle.stop_all().await;
    if summary.is_clean() {
        info!(
            completed = summary.completed.len(),
            "Shutdown complete"
        );
    } else {
        error!(
            failed = summary.failed.len(),
            unfinished = summary.unfinished.len(),
            timed_out = summary.timed_out,
            "Shutdown finished with problems"
        );
    }
    Ok(summary)
}
