use std::path::Path;

use anyhow::Context;
use tracing::{error, info, warn};
use tron_core::config::{MasterConfig, WarnLevel};
use tron_core::MasterControlProgram;

use crate::local_pools;

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config_path))
}

/// Load the config, restore state and drive the controller until Ctrl-C.
async fn serve(config_path: &Path) -> anyhow::Result<()> {
    let config = MasterConfig::load(config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    for w in config.validate() {
        match w.level {
            WarnLevel::Warning => warn!("{}", w.message),
            WarnLevel::Error => error!("{}", w.message),
        }
    }

    let pools = local_pools(&config).context("failed to build node pools")?;
    let state_dir = config.state_dir_for(config_path);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let mut mcp = MasterControlProgram::new(&state_dir, pools);
    let rejected = mcp.apply_config(&config);
    if !rejected.is_empty() {
        warn!(count = rejected.len(), "some config entries were rejected");
    }
    let restored = mcp.load_state().context("failed to restore state")?;
    info!(restored, state_dir = %state_dir.display(), "starting controller");
    mcp.resume().context("failed to resume controller")?;

    mcp.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutting down");
    })
    .await
    .context("controller loop failed")?;
    Ok(())
}
