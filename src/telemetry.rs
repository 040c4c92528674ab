use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging for the registration service.
///
/// Respects `RUST_LOG`; defaults to `info`. Token redemption causes are
/// logged at `debug` and stay hidden at the default level.
pub fn init_telemetry() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("telemetry init failed: {e}"))?;

    tracing::info!("welcome-mat telemetry initialized");
    Ok(())
}
