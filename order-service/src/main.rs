mod api;
mod config;
mod error;
mod handlers;
mod models;
mod pricing;
mod repository;
mod schema;
mod service;

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
use crate::handlers::StatusEventHandler;
use crate::repository::PgOrderRepository;
use crate::service::OrderService;

const CONSUMER_TAG: &str = "order-service";

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
        .declare_queue_with_dead_letter(&args.status_queue, &args.exchange)
        .await?;
    for event_type in event_types::STATUS_EVENTS {
        broker.bind(&args.status_queue, event_type, &args.exchange).await?;
    }
    broker.set_qos(args.prefetch).await?;

    let publisher = Arc::new(broker.publisher(&args.exchange).await?);
    let metrics = Arc::new(MetricsRecorder::new("order-service"));
    let repository = Arc::new(PgOrderRepository::new(pool));
    let service = Arc::new(OrderService::new(repository, publisher.clone(), metrics.clone()));

    let status_handler = Arc::new(StatusEventHandler::new(service.clone()));
    let dispatcher = event_types::STATUS_EVENTS
        .into_iter()
        .fold(Dispatcher::new(), |dispatcher, event_type| {
            dispatcher.on(event_type, status_handler.clone())
        });
    let worker_pool = WorkerPool::new(args.workers, dispatcher, args.retry_policy(), metrics);

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    let deliveries = broker.consume(&args.status_queue, CONSUMER_TAG).await?;
    let listener = shutdown.subscribe();
    let consumer = tokio::spawn(async move { worker_pool.run(deliveries, listener).await });

    let app = api::create_router(api::AppState { service });
    let tcp = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Order service web server started on port {}", args.port);

    let mut server_shutdown = shutdown.subscribe();
    let served = axum::serve(tcp, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await;
    if let Err(e) = &served {
        error!("HTTP server failed: {}", e);
    }

    shutdown.trigger();
    if let Err(e) = consumer.await {
        error!("Status consumer task failed: {}", e);
    }

    if let Err(e) = broker.cancel(CONSUMER_TAG).await {
        error!("Failed to cancel consumer: {}", e);
    }
    if let Err(e) = publisher.close().await {
        error!("Failed to close publisher: {}", e);
    }
    broker.close().await?;
    info!("Order service stopped");

    served.map_err(Into::into)
}
