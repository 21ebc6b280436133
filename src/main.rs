use dotenvy::dotenv;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use supportserver::agent::TemplateAgent;
use supportserver::api;
use supportserver::channels::{SmtpDeliveryClient, WebDeliveryClient, WhatsAppDeliveryClient};
use supportserver::config::AppConfig;
use supportserver::dispatch::{DispatchConfig, Dispatcher};
use supportserver::engine::Engine;
use supportserver::escalation::StoreEscalationSink;
use supportserver::kb::{HttpSearchProvider, KnowledgeOrchestrator};
use supportserver::queue::PartitionedQueue;
use supportserver::shared::state::AppState;
use supportserver::store::postgres::create_pool;
use supportserver::store::{EngineStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env()?;

    let store: Arc<dyn EngineStore> = match &config.database.url {
        Some(url) => {
            let pool = create_pool(url)?;
            info!("Using PostgreSQL store");
            Arc::new(PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set, using embedded in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let mut dispatcher = Dispatcher::new(DispatchConfig {
        max_attempts: config.engine.max_dispatch_attempts,
        base_backoff_ms: config.engine.dispatch_backoff_ms,
    });
    dispatcher.register(Arc::new(SmtpDeliveryClient::new(config.smtp.clone())?));
    dispatcher.register(Arc::new(WhatsAppDeliveryClient::new(
        config.whatsapp.clone(),
    )));
    dispatcher.register(Arc::new(WebDeliveryClient::new()));

    let knowledge = KnowledgeOrchestrator::new(
        Arc::new(HttpSearchProvider::new(config.knowledge.endpoint.clone())),
        config.engine.search_rate_per_second,
        config.knowledge.top_k,
    );

    let engine = Arc::new(Engine::new(
        store.clone(),
        knowledge,
        Arc::new(TemplateAgent),
        Arc::new(dispatcher),
        Arc::new(StoreEscalationSink::new(store.clone())),
        config.engine.clone(),
    ));

    let queue = Arc::new(PartitionedQueue::new(config.engine.partitions));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = engine.spawn_workers(&queue, shutdown_rx);
    info!("Started {} partition workers", workers.len());

    let state = Arc::new(AppState {
        config: config.clone(),
        store,
        queue,
    });

    let app = api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Stop pulling new events and give in-flight ones a grace period.
    info!("Shutting down, draining workers");
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.engine.shutdown_grace_secs);
    for worker in workers {
        if tokio::time::timeout(grace, worker).await.is_err() {
            warn!("Worker did not stop within the grace period");
        }
    }
    info!("Shutdown complete");
    Ok(())
}
