use tailbridge::{config, runner, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let cfg = config::load()?;

    let handle = runner::start_bridge(
        cfg,
        runner::BridgeOptions {
            init_tracing: false,
            ..Default::default()
        },
    )
    .await?;

    runner::wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, stopping bridge");
    handle.shutdown().await
}
