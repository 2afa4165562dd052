//! Background sweeps
//!
//! The only timeout-driven state changes in the coordinator: releasing
//! wallet holds whose period elapsed, and expiring driver presences that
//! went silent. Both are periodic re-evaluation, never blocking waits.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::AppState;

pub fn spawn_background_jobs(state: &Arc<AppState>) {
    let wallet = Arc::clone(&state.wallet);
    let hold_interval = state.config.hold_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(hold_interval);
        loop {
            ticker.tick().await;
            let released = wallet.release_due_holds(Utc::now());
            if released > 0 {
                info!(released, "hold release sweep");
            }
        }
    });

    let index = Arc::clone(&state.index);
    let presence_interval = state.config.presence_sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(presence_interval);
        loop {
            ticker.tick().await;
            let purged = index.purge_stale(Utc::now());
            if purged > 0 {
                info!(purged, "presence purge sweep");
            }
        }
    });
}
