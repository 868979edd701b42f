mod app;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use tabdeck_lib::sync::{
    AutoSyncEvent, ConflictResolution, SyncOptions, SyncRequest, WebDAVConfig,
};

#[derive(Parser)]
#[command(name = "tabdeck-cli", about = "Tabdeck WebDAV sync engine", version)]
struct Cli {
    /// Directory holding the sync records (default: platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show sync status
    Status,

    /// Show sync statistics
    Stats,

    /// Set the WebDAV server and credentials
    Configure {
        /// Server URL, e.g. https://cloud.example.com/remote.php/dav/files/me
        #[arg(long)]
        url: String,
        #[arg(long)]
        username: String,
        /// Password (use "-" to read from stdin)
        #[arg(long, default_value = "-")]
        password: String,
        /// Remote directory for the synced data
        #[arg(long, default_value = "/tabdeck")]
        sync_path: String,
        /// Turn on periodic sync
        #[arg(long)]
        enable: bool,
        /// Periodic sync interval in minutes
        #[arg(long)]
        interval: Option<u32>,
    },

    /// Test the connection to the server
    Test,

    /// Bidirectional sync
    Sync {
        /// Skip the remote backup before overwriting
        #[arg(long)]
        no_backup: bool,
    },

    /// Push local data to the server
    Upload {
        /// Skip the remote backup before overwriting
        #[arg(long)]
        no_backup: bool,
    },

    /// Replace local data with the server copy
    Download,

    /// Resolve a stored conflict
    Resolve {
        resolution: Resolution,
    },

    /// Turn periodic sync on or off
    AutoSync {
        state: Toggle,
        /// Interval in minutes
        #[arg(long)]
        interval: Option<u32>,
    },

    /// Feed an event to the auto-sync debouncer
    Trigger {
        event: Event,
    },

    /// Show or change event-driven auto-sync settings
    AutoConfig {
        #[arg(long)]
        auto_upload: Option<bool>,
        #[arg(long)]
        auto_download: Option<bool>,
        /// Debounce window for data-changed events
        #[arg(long)]
        delay_ms: Option<u64>,
        #[arg(long)]
        download_on_open: Option<bool>,
        /// Only download when the server copy is newer
        #[arg(long)]
        check_freshness: Option<bool>,
    },

    /// Remove all sync state except the device id
    Clear,

    /// Send a raw JSON request (use "-" to read from stdin)
    Rpc {
        request: String,
    },

    /// Run periodic sync until interrupted
    Daemon,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Resolution {
    Manual,
    UseLocal,
    UseRemote,
    Merge,
}

impl From<Resolution> for ConflictResolution {
    fn from(r: Resolution) -> Self {
        match r {
            Resolution::Manual => ConflictResolution::Manual,
            Resolution::UseLocal => ConflictResolution::UseLocal,
            Resolution::UseRemote => ConflictResolution::UseRemote,
            Resolution::Merge => ConflictResolution::Merge,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Event {
    DataChanged,
    TabOpened,
}

impl From<Event> for AutoSyncEvent {
    fn from(e: Event) -> Self {
        match e {
            Event::DataChanged => AutoSyncEvent::DataChanged,
            Event::TabOpened => AutoSyncEvent::TabOpened,
        }
    }
}

/// Resolve "-" as a line read from stdin
fn resolve_stdin(value: String) -> Result<String> {
    if value != "-" {
        return Ok(value);
    }
    let mut buf = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf)
        .context("Failed to read stdin")?;
    Ok(buf.trim_end_matches(['\r', '\n']).to_string())
}

fn transfer_options(no_backup: bool) -> SyncOptions {
    if no_backup {
        SyncOptions::without_backup()
    } else {
        SyncOptions::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let app = app::App::open(cli.data_dir).await?;

    let success = match cli.command {
        Command::Status => app.call(SyncRequest::GetStatus).await?,
        Command::Stats => app.call(SyncRequest::GetSyncStats).await?,
        Command::Configure {
            url,
            username,
            password,
            sync_path,
            enable,
            interval,
        } => {
            let config = WebDAVConfig {
                server_url: url,
                username,
                password: resolve_stdin(password)?,
                sync_path,
                enabled: enable,
                auto_sync_interval: interval,
            };
            app.call(SyncRequest::UpdateConfig { config }).await?
        }
        Command::Test => app.call(SyncRequest::TestConnection).await?,
        Command::Sync { no_backup } => {
            app.call(SyncRequest::Sync {
                options: transfer_options(no_backup),
            })
            .await?
        }
        Command::Upload { no_backup } => {
            app.call(SyncRequest::Upload {
                options: transfer_options(no_backup),
            })
            .await?
        }
        Command::Download => app.call(SyncRequest::Download).await?,
        Command::Resolve { resolution } => {
            app.call(SyncRequest::ResolveConflict {
                resolution: resolution.into(),
            })
            .await?
        }
        Command::AutoSync { state, interval } => {
            app.call(SyncRequest::EnableAutoSync {
                enabled: matches!(state, Toggle::On),
                interval_minutes: interval,
            })
            .await?
        }
        Command::Trigger { event } => {
            let event: AutoSyncEvent = event.into();
            let success = app.call(SyncRequest::TriggerAutoSync { event_type: event }).await?;
            if success && event == AutoSyncEvent::DataChanged {
                app.settle_debounce().await?;
            }
            success
        }
        Command::AutoConfig {
            auto_upload,
            auto_download,
            delay_ms,
            download_on_open,
            check_freshness,
        } => {
            let changes = [auto_upload, auto_download, download_on_open, check_freshness];
            if changes.iter().all(Option::is_none) && delay_ms.is_none() {
                app.call(SyncRequest::GetAutoSyncConfig).await?
            } else {
                let mut config = app.engine.auto_sync.config().await?;
                if let Some(v) = auto_upload {
                    config.enable_auto_upload = v;
                }
                if let Some(v) = auto_download {
                    config.enable_auto_download = v;
                }
                if let Some(v) = delay_ms {
                    config.upload_delay_ms = v;
                }
                if let Some(v) = download_on_open {
                    config.download_on_page_open = v;
                }
                if let Some(v) = check_freshness {
                    config.check_remote_freshness = v;
                }
                app.call(SyncRequest::UpdateAutoSyncConfig { config }).await?
            }
        }
        Command::Clear => app.call(SyncRequest::ClearSyncData).await?,
        Command::Rpc { request } => app.call_json(&resolve_stdin(request)?).await?,
        Command::Daemon => {
            app.run_daemon().await?;
            true
        }
    };

    if !success {
        bail!("request failed");
    }
    Ok(())
}
