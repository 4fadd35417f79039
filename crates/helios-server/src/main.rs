//! Main entry point for the Helios master/agent runtime.

use helios_server::{
    config::Configuration,
    metrics,
    runtime::{self, RuntimeSettings},
    startup,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let configuration = Configuration::new()?;

    let logging_config = configuration.logging_config()?;
    let _logging_guard =
        startup::init_logging(&logging_config).map_err(|e| anyhow::anyhow!("{e}"))?;

    metrics::init_metrics();

    let settings = RuntimeSettings::from_config(&configuration)?;
    info!(
        mode = %settings.mode,
        profile = configuration.profile().unwrap_or("default"),
        master = %settings.master,
        agent = %settings.agent,
        "Starting Helios"
    );

    let shutdown = startup::wait_for_shutdown_signal();
    runtime::run(settings, shutdown).await
}
