use std::sync::Arc;

use messaging_service::{
    config, db, error, logging,
    middleware::auth,
    routes,
    state::AppState,
    store::PgConversationStore,
    websocket::pubsub::{self, Publisher},
};

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    // Migration failures are fatal; the schema must be in sync before we
    // accept connections.
    db::MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| error::AppError::StartServer(format!("database migrations failed: {e}")))?;

    auth::initialize_jwt_validation(&cfg.jwt_public_key_pem)?;

    let store = Arc::new(PgConversationStore::new(pool));

    // Without Redis the instance runs standalone; presence and typing are
    // process-local either way.
    let publisher = match cfg.redis_url.as_deref() {
        Some(url) => {
            let client = redis::Client::open(url)
                .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;
            Some(Publisher::new(client))
        }
        None => None,
    };

    let state = AppState::build(store, cfg.clone(), publisher.clone());
    state.spawn_background_tasks();

    if let Some(publisher) = publisher {
        let registry = state.registry.clone();
        let origin = publisher.origin();
        let redis_url = cfg.redis_url.clone().unwrap_or_default();
        tokio::spawn(async move {
            loop {
                let client = match redis::Client::open(redis_url.as_str()) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "fanout listener: bad redis url");
                        return;
                    }
                };
                if let Err(e) = pubsub::start_listener(client, origin, registry.clone()).await {
                    tracing::error!(error = %e, "fanout listener failed; restarting");
                }
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        });
    }

    let bind_addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!(%bind_addr, "starting orbit-messaging-service");

    let app = routes::build_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| error::AppError::StartServer(e.to_string()))?;

    Ok(())
}
