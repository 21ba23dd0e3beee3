use anyhow::Context;
use transfer_reconciler::config::Config;
use transfer_reconciler::log_info;
use transfer_reconciler::startup::Application;
use transfer_reconciler::utils::logger::init_logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env 可选
    dotenvy::dotenv().ok();

    // 初始化日志（全局只需调用一次）
    init_logger();

    log_info!("Starting application initialization...");

    let config = Config::load().context("Failed to load application configuration")?;

    let application = Application::build(config)
        .await
        .context("Application building failed (DB/relay initialization)")?;

    log_info!("Application build complete. Starting reconciliation loop.");

    application
        .run()
        .await
        .context("Reconciler failed during runtime")?;

    Ok(())
}
