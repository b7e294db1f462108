mod config;
mod error;
mod gateway;
mod handlers;
mod models;
mod repository;
mod schema;
mod stock_client;

use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use shared::broker::Broker;
use shared::consumer::{Dispatcher, WorkerPool};
use shared::event_types;
use shared::metrics::MetricsRecorder;
use shared::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::gateway::RandomGateway;
use crate::handlers::OrderCreatedHandler;
use crate::repository::PgPaymentStore;
use crate::stock_client::HttpStockClient;

const CONSUMER_TAG: &str = "payment-service";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&args.database_url)?;
    conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = bb8::Pool::builder()
        .connection_timeout(Duration::from_secs(5))
        .build(manager)
        .await?;

    let broker = Broker::connect(&args.amqp_url).await?;
    broker.declare_exchange(&args.exchange).await?;
    broker
        .declare_queue_with_dead_letter(&args.queue, &args.exchange)
        .await?;
    broker
        .bind(&args.queue, event_types::ORDER_CREATED, &args.exchange)
        .await?;
    broker.set_qos(args.prefetch).await?;

    let publisher = Arc::new(broker.publisher(&args.exchange).await?);
    let metrics = Arc::new(MetricsRecorder::new("payment-service"));

    let handler = Arc::new(OrderCreatedHandler::new(
        Arc::new(PgPaymentStore::new(pool)),
        Arc::new(HttpStockClient::new(&args.product_service_url, args.stock_timeout())?),
        Arc::new(RandomGateway::new(args.payment_success_rate, args.max_payment_latency())),
        publisher.clone(),
        metrics.clone(),
    ));
    let dispatcher = Dispatcher::new().on(event_types::ORDER_CREATED, handler);
    let worker_pool = WorkerPool::new(args.workers, dispatcher, args.retry_policy(), metrics);

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    let deliveries = broker.consume(&args.queue, CONSUMER_TAG).await?;
    info!(workers = worker_pool.size(), queue = %args.queue, "Payment service started");
    worker_pool.run(deliveries, shutdown.subscribe()).await;

    if let Err(e) = broker.cancel(CONSUMER_TAG).await {
        error!("Failed to cancel consumer: {}", e);
    }
    if let Err(e) = publisher.close().await {
        error!("Failed to close publisher: {}", e);
    }
    broker.close().await?;
    info!("Payment service stopped");
    Ok(())
}
