use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use stepweave_engine::{EngineSettings, PgStepStore, load_workflows};
use stepweave_workflow::{
    FunctionRegistry, GraphRunner, NatsQueue, register_flow_control, register_workers,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = EngineSettings::from_env().expect("failed to load configuration");
    tracing::info!(workflows_dir = %settings.workflows_dir.display(), "Loaded configuration");

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&settings.database_url)
        .await
        .expect("failed to connect to database");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    // Application functions are registered here alongside flow control.
    let mut functions = FunctionRegistry::new();
    register_flow_control(&mut functions);

    let workflows =
        load_workflows(&settings.workflows_dir, &functions).expect("failed to load workflows");

    let queue = NatsQueue::new(settings.nats_config())
        .await
        .expect("failed to connect to NATS");

    let runner = Arc::new(GraphRunner::new(
        Arc::new(PgStepStore::new(db_pool)),
        Arc::new(queue),
        Arc::new(functions),
        Arc::new(workflows),
        settings.engine_config(),
    ));

    let workers = register_workers(Arc::clone(&runner), settings.retry_policy())
        .await
        .expect("failed to register queue workers");
    tracing::info!(workers, "engine running");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }

    tracing::info!("shutting down");
    runner.queue().shutdown().await;
}
