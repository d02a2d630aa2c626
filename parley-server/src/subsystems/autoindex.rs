//! Background indexing worker
//!
//! Periodically runs the same batch step as `POST /api/bot/process_unprocessed`
//! so uploads become searchable without an operator call. Disabled when
//! `index.auto_index_interval_minutes` is 0. Claims make it safe to run next
//! to manual triggers.

use std::sync::Arc;

use parley_core::error::Result;
use parley_ingest::{BatchReport, Indexer};
use tokio::sync::broadcast;
use tokio::time::{interval, Duration, MissedTickBehavior};

pub async fn run_auto_index_worker(
    indexer: Arc<Indexer>,
    index_name: String,
    batch_size: usize,
    interval_minutes: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    if interval_minutes == 0 {
        tracing::info!("Auto-index worker disabled via config");
        return;
    }

    let mut ticker = interval(Duration::from_secs(interval_minutes * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_min = interval_minutes,
        batch_size,
        index = %index_name,
        "Auto-index worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match run_auto_index_tick(&indexer, &index_name, batch_size).await {
                    Ok(report) => {
                        if !report.is_empty() {
                            tracing::info!(
                                indexed = report.indexed_ids.len(),
                                failed = report.failed.len(),
                                "Auto-index tick complete"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Auto-index tick failed"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Auto-index worker shutting down");
                break;
            }
        }
    }
}

/// One batch. Public for testing.
pub async fn run_auto_index_tick(
    indexer: &Indexer,
    index_name: &str,
    batch_size: usize,
) -> Result<BatchReport> {
    indexer.process_unprocessed(index_name, batch_size).await
}
