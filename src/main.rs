use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use wa_bridge::bootstrap;
use wa_bridge::config::Config;
use wa_bridge::gateway::Gateway;
use wa_bridge::server::app::{bind_address, build_router};
use wa_bridge::server::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_env();
    let filter = EnvFilter::try_new(config.log_level()).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let bootstrap = match bootstrap::bootstrap(&config).await {
        Ok(bootstrap) => bootstrap,
        Err(err) => {
            tracing::error!(error = %err, "fatal startup failure");
            return ExitCode::from(1);
        }
    };

    let port = config.port();
    let gateway = Gateway::new(config, bootstrap);
    let gateway_task = tokio::spawn(Gateway::run(gateway.clone()));
    let backup_task = gateway.spawn_backup();

    let app = build_router(AppState {
        gateway: gateway.clone(),
    });
    let addr = bind_address(port);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, %addr, "failed to bind HTTP listener");
            return ExitCode::from(1);
        }
    };
    tracing::info!(%addr, "wa-bridge listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        tracing::error!(error = %err, "http server error");
    }

    tracing::info!("shutting down");
    if tokio::time::timeout(Gateway::shutdown_budget(), gateway.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("shutdown exceeded its budget, forcing exit");
    }
    gateway_task.abort();
    if let Some(backup_task) = backup_task {
        backup_task.abort();
    }

    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
