//! Grid trading engine daemon
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the working directory:
//!    ```
//!    ENCRYPTION_KEY=<hex key from CredentialCipher::generate_key()>
//!    DATABASE_URL=sqlite://gridcore.db
//!    EXCHANGE_BASE_URL=https://api.mexc.com
//!    ```
//!
//! 2. Run the daemon:
//!    ```bash
//!    cargo run --bin gridcored
//!    ```
//!
//! On startup the daemon restores every bot that was active when the
//! process last exited, replays fills that happened while it was down and
//! resumes monitoring. It runs until interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use rust_decimal::Decimal;

use gridcore::{
    BotManager, CredentialCipher, Db, Gateway, GridStrategy, HealthChecker, LogSink, MexcRest,
    OrderMonitor, Settings,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match dotenvy::dotenv() {
        Ok(path) => info!("loaded environment from {}", path.display()),
        Err(_) => info!("no .env file, using process environment"),
    }

    if let Err(error) = run().await {
        error!("fatal: {error}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run() -> gridcore::EngineResult<()> {
    let settings = Settings::from_env()?;

    let db = Db::connect(&settings.database_url).await?;
    db.migrate().await?;

    let cipher = CredentialCipher::from_hex_key(&settings.encryption_key)?;
    let api = Arc::new(MexcRest::new(settings.exchange_base_url.clone()));
    let gateway = Arc::new(Gateway::new(api, db.clone(), cipher));

    let strategy = Arc::new(GridStrategy::new(db.clone(), gateway.clone()));
    let sink = Arc::new(LogSink);
    let monitor = Arc::new(OrderMonitor::new(
        db.clone(),
        gateway.clone(),
        strategy.clone(),
        sink.clone(),
        Duration::from_secs(settings.order_check_interval),
        Decimal::from(settings.profit_notify_percent),
    ));
    let manager = BotManager::new(
        db.clone(),
        gateway.clone(),
        strategy,
        monitor.clone(),
        sink.clone(),
        settings.clone(),
    );

    let restored = manager.restore_after_restart().await?;
    info!("engine up, {restored} bots restored");

    let health = Arc::new(HealthChecker::new(
        db,
        gateway,
        sink,
        Duration::from_secs(settings.health_check_interval),
    ));
    let health_task = tokio::spawn(health.run());

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    info!("shutdown requested");

    health_task.abort();
    monitor.stop_all().await;
    Ok(())
}
