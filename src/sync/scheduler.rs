use std::sync::{Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::config::clamp_interval;

/// Receiver of periodic ticks
#[async_trait]
pub trait AutoSyncTarget: Send + Sync {
    /// Run one scheduled sync. Must swallow its own failures and return
    /// immediately when a task is already in flight.
    async fn auto_sync(&self);
}

/// Messages to control the sync scheduler
#[derive(Debug)]
pub enum SyncSchedulerMessage {
    /// (Re)start ticking at this many minutes
    Start(u32),
    /// Stop ticking, keep the loop alive
    Stop,
    /// Owner is going away
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy)]
struct SchedulerState {
    running: bool,
    interval_minutes: Option<u32>,
}

/// Handle for the periodic sync scheduler
pub struct IntervalScheduler {
    sender: mpsc::UnboundedSender<SyncSchedulerMessage>,
    state: Mutex<SchedulerState>,
}

impl IntervalScheduler {
    /// Spawn the scheduler loop on the current tokio runtime. The loop holds
    /// only a weak reference to its target and exits once the target is
    /// dropped.
    pub fn spawn(target: Weak<dyn AutoSyncTarget>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            sync_scheduler_loop(target, rx).await;
        });

        Self {
            sender: tx,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, message: SyncSchedulerMessage) {
        if let Err(e) = self.sender.send(message) {
            log::error!("Sync scheduler: failed to deliver control message: {}", e);
        }
    }

    /// Start (or restart) ticking. Returns the clamped interval in use.
    pub fn start(&self, interval_minutes: u32) -> u32 {
        let minutes = clamp_interval(interval_minutes);
        {
            let mut state = self.state();
            state.running = true;
            state.interval_minutes = Some(minutes);
        }
        if minutes != interval_minutes {
            log::info!(
                "Sync scheduler: interval {} min clamped to {} min",
                interval_minutes,
                minutes
            );
        }
        self.send(SyncSchedulerMessage::Start(minutes));
        minutes
    }

    pub fn stop(&self) {
        let was_running = std::mem::replace(&mut self.state().running, false);
        if was_running {
            self.send(SyncSchedulerMessage::Stop);
        }
    }

    /// Restart with a new interval if running, otherwise just remember it
    pub fn update_interval(&self, interval_minutes: u32) {
        if self.is_running() {
            self.start(interval_minutes);
        } else {
            self.state().interval_minutes = Some(clamp_interval(interval_minutes));
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Clamped interval last requested, whether or not running
    pub fn interval_minutes(&self) -> Option<u32> {
        self.state().interval_minutes
    }

    /// Shut down the scheduler loop
    pub fn shutdown(&self) {
        self.state().running = false;
        let _ = self.sender.send(SyncSchedulerMessage::Shutdown);
    }
}

/// Main scheduler loop
async fn sync_scheduler_loop(
    target: Weak<dyn AutoSyncTarget>,
    mut receiver: mpsc::UnboundedReceiver<SyncSchedulerMessage>,
) {
    log::info!("Sync scheduler started");
    let mut period: Option<Duration> = None;

    loop {
        let message = match period {
            Some(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let Some(target) = target.upgrade() else {
                            break;
                        };
                        log::debug!("Sync scheduler: tick");
                        // Run detached so a slow sync never delays control
                        // messages; overlapping ticks no-op in the target.
                        tokio::spawn(async move {
                            target.auto_sync().await;
                        });
                        continue;
                    }
                    msg = receiver.recv() => msg,
                }
            }
            None => receiver.recv().await,
        };

        match message {
            Some(SyncSchedulerMessage::Start(minutes)) => {
                log::info!("Sync scheduler: running every {} min", minutes);
                period = Some(Duration::from_secs(u64::from(minutes) * 60));
            }
            Some(SyncSchedulerMessage::Stop) => {
                log::info!("Sync scheduler: stopped");
                period = None;
            }
            Some(SyncSchedulerMessage::Shutdown) | None => {
                break;
            }
        }
    }

    log::info!("Sync scheduler: shutting down");
}
