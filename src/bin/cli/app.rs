use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use tabdeck_lib::sync::{RpcChannel, SyncRequest, SyncResponse};
use tabdeck_lib::SyncEngine;

/// Shared state for CLI commands
pub struct App {
    pub engine: SyncEngine,
}

impl App {
    /// Open the engine over the given or default data directory
    pub async fn open(data_dir: Option<PathBuf>) -> Result<Self> {
        let engine = SyncEngine::open(data_dir)
            .await
            .context("Failed to open sync data directory")?;
        Ok(Self { engine })
    }

    /// Run one request and print its response. Returns whether it succeeded.
    pub async fn call(&self, request: SyncRequest) -> Result<bool> {
        let response = self.engine.rpc.handle(request).await;
        print_json(&response)?;
        Ok(response.success)
    }

    /// Raw JSON request, as a UI would send it
    pub async fn call_json(&self, raw: &str) -> Result<bool> {
        let request: serde_json::Value =
            serde_json::from_str(raw).context("Request is not valid JSON")?;
        let response = self.engine.rpc.handle_json(request).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
        Ok(response["success"].as_bool().unwrap_or(false))
    }

    /// Wait out a pending debounced upload so the process does not exit
    /// before it fires
    pub async fn settle_debounce(&self) -> Result<()> {
        let config = self.engine.auto_sync.config().await?;
        tokio::time::sleep(Duration::from_millis(config.upload_delay_ms + 250)).await;
        while self.engine.manager.is_sync_in_progress() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Run the schedulers until Ctrl-C
    pub async fn run_daemon(&self) -> Result<()> {
        let stats = self.engine.manager.get_sync_stats().await?;
        log::info!(
            "Daemon running for device {} (auto sync: {}, interval: {:?})",
            stats.device_id,
            stats.auto_sync_enabled,
            stats.auto_sync_interval
        );
        eprintln!("tabdeck daemon running, press Ctrl-C to stop");

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;

        log::info!("Daemon shutting down");
        self.engine.shutdown();
        Ok(())
    }
}

fn print_json(response: &SyncResponse) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(())
}
