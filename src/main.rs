use anyhow::Context;
use tracing::info;

use checkout_api::{app_router, config, db, events, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&app_config.log_level, app_config.log_json);

    info!(
        environment = %app_config.environment,
        "starting checkout-api v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = db::establish_connection(&app_config)
        .await
        .context("failed to connect to the database")?;

    let event_sender = events::start();
    let state = AppState::new(pool, app_config.clone(), event_sender);
    let app = app_router(state);

    let addr = format!("{}:{}", app_config.host, app_config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("shutdown signal received");
}
