use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::delivery::worker;
use crate::state::{EngineEvent, SharedState};

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(state: SharedState) -> Self {
        let (shutdown, rx) = watch::channel(false);

        let handles = vec![
            tokio::spawn(delivery_loop(state.clone(), rx.clone())),
            tokio::spawn(verification_loop(state, rx)),
        ];
        tracing::info!("Scheduler started");

        Self { shutdown, handles }
    }

    /// Signal both loops and wait for the cycles in flight to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler task ended abnormally: {e}");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn delivery_loop(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.delivery.poll_interval;
    tracing::debug!("Delivery loop started ({}s interval)", interval.as_secs());

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = worker::run_cycle(&state, Utc::now()).await {
            tracing::error!("Delivery cycle skipped: {e}");
            state.emit(EngineEvent::CycleSkipped {
                scope: "delivery".to_string(),
                error: e.to_string(),
            });
        }

        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }

    tracing::debug!("Delivery loop stopped");
}

async fn verification_loop(state: SharedState, mut shutdown: watch::Receiver<bool>) {
    let interval = state.config.verification.sweep_interval;
    tracing::debug!("Verification loop started ({}s interval)", interval.as_secs());

    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        if let Err(e) = state.verification.run_sweep(now).await {
            tracing::error!("Verification sweep skipped: {e}");
            state.emit(EngineEvent::CycleSkipped {
                scope: "verification".to_string(),
                error: e.to_string(),
            });
        }
        if let Err(e) = state.dkim.purge_retired(now).await {
            tracing::error!("Retired DKIM key purge failed: {e}");
        }

        if !sleep_or_shutdown(interval, &mut shutdown).await {
            break;
        }
    }

    tracing::debug!("Verification loop stopped");
}

/// Returns false once shutdown has been signalled.
async fn sleep_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}
