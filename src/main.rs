use std::sync::Arc;

use models::{AppState, Config, Error};
use services::{GeneratorService, WorkerService};
use tokio::signal;
use tracing::info;

mod db;
mod features;
mod flags;
mod models;
mod otel;
mod services;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let flags = flags::Shelfq::from_env_or_exit();
    let mut config = Config::from_env()?;
    if let Some(database_url) = flags.database_url {
        config.database_url = database_url;
    }
    let _provider = otel::init_tracing(config.otel_stdout);

    let state = AppState::new(config).await?;
    if flags.list {
        return list_jobs(&state).await;
    }

    // No job of this process can be running yet.
    state.store.fail_orphaned().await?;

    let generator = GeneratorService::new(Arc::clone(&state));
    if state.generator_options.on_start && !flags.no_generate {
        let clear = state.generator_options.clear_on_start && !flags.keep_backlog;
        generator.generate(clear).await?;
    }

    tokio::spawn(shutdown_signal(Arc::clone(&state)));
    let worker = WorkerService::new(Arc::clone(&state));
    if flags.drain {
        worker.drain().await?;
        return Ok(());
    }

    let (worker_res, generator_res) = tokio::join!(worker.run(), generator.run());
    worker_res?;
    generator_res?;

    info!({ instance_id = state.instance_id }, "shutdown");
    Ok(())
}

async fn list_jobs(state: &AppState) -> Result<(), Error> {
    for job in state.store.list().await? {
        println!("{}", serde_json::to_string(&job)?);
    }
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    state.shutdown_token.cancel();
    tracing::warn!("signal received, starting graceful shutdown");
}
