pub mod app;
pub mod config;
pub mod conn;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod protocol;
pub mod supervisor;
pub mod telemetry;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    overrides: config::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
