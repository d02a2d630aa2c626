//! Idle session sweeper
//!
//! Expired sessions are rebuilt lazily on their next message anyway; the
//! sweeper only bounds registry growth from conversations that never return.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

use super::session::SessionManager;

pub async fn run_session_sweeper(
    sessions: Arc<SessionManager>,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    if interval_minutes == 0 {
        tracing::info!("Session sweeper disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(interval_min = interval_minutes, "Session sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = sessions.evict_expired();
                tracing::debug!(evicted, live = sessions.session_count(), "Session sweep complete");
            }
            _ = shutdown.recv() => {
                tracing::info!("Session sweeper shutting down");
                break;
            }
        }
    }
}
