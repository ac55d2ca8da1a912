use std::sync::Arc;

use anyhow::Context;
use heartlink_shared::clients::db::create_pool;
use heartlink_shared::clients::rabbitmq::RabbitMQClient;
use heartlink_shared::clients::redis::RedisClient;
use tokio::sync::watch;

use heartlink_pairing::accounts::{AccountDirectory, HttpAccountDirectory, StaticDirectory};
use heartlink_pairing::config::{AppConfig, StoreBackend};
use heartlink_pairing::events::EventPublisher;
use heartlink_pairing::presence::{MemoryPresence, RedisPresence};
use heartlink_pairing::store::{MemoryStore, PgStore};
use heartlink_pairing::{build_router, socket_layer, AppState, Backends};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    heartlink_shared::middleware::init_tracing("heartlink-pairing");

    let config = AppConfig::load()?;
    let port = config.port;

    let metrics_handle = heartlink_shared::middleware::init_metrics()?;

    let events = if config.rabbitmq_url.is_empty() {
        tracing::info!("rabbitmq url not set; domain events disabled");
        EventPublisher::disabled()
    } else {
        let client = RabbitMQClient::connect(&config.rabbitmq_url)
            .await
            .context("connecting to rabbitmq")?;
        EventPublisher::new(client)
    };

    let accounts: Arc<dyn AccountDirectory> = if config.account_service_url.is_empty() {
        tracing::warn!("account service url not set; every account may pair");
        Arc::new(StaticDirectory::allow_all())
    } else {
        Arc::new(HttpAccountDirectory::new(config.account_service_url.clone())?)
    };

    let backends = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = create_pool(&config.database_url, config.db_pool_size).context("creating database pool")?;
            let redis = RedisClient::connect(&config.redis_url)
                .await
                .context("connecting to redis")?;
            tracing::info!(url = %config.redis_url, "connected to Redis");
            let store = Arc::new(PgStore::new(pool));
            Backends {
                store: store.clone(),
                messages: store,
                presence: Arc::new(RedisPresence::new(redis)),
                accounts,
                events,
            }
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; state is lost on restart and not shared between processes");
            Backends {
                accounts,
                events,
                ..Backends::in_memory(Arc::new(MemoryStore::new()), Arc::new(MemoryPresence::new()))
            }
        }
    };

    let state = Arc::new(AppState::new(config, backends, Some(metrics_handle)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(state.sweeper().run(shutdown_rx));

    let app = build_router(state.clone()).layer(socket_layer(state));

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(addr = %addr, "heartlink-pairing starting");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    tracing::info!("heartlink-pairing stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
