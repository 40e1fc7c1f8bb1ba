//! Periodic sampling so the historical store receives a continuous series.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use pulse_metrics::IndicatorKind;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::service::MonitorService;

/// Handle for controlling the sampling task.
#[derive(Debug)]
pub struct SamplerHandle {
    running: Arc<AtomicBool>,
    rounds: Arc<AtomicU64>,
}

impl SamplerHandle {
    /// Check if the sampling task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Completed sampling rounds.
    #[must_use]
    pub fn rounds(&self) -> u64 {
        self.rounds.load(Ordering::SeqCst)
    }

    /// Stop the sampling task after its current round.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Start sampling `kinds` every `interval`.
///
/// The families of one round are sampled concurrently. The first round
/// runs immediately; a round that overruns delays the next one instead of
/// bunching up.
pub fn start_sampling_task(
    service: Arc<MonitorService>,
    kinds: Vec<IndicatorKind>,
    interval: Duration,
) -> SamplerHandle {
    let running = Arc::new(AtomicBool::new(true));
    let rounds = Arc::new(AtomicU64::new(0));
    let handle = SamplerHandle {
        running: Arc::clone(&running),
        rounds: Arc::clone(&rounds),
    };

    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while running.load(Ordering::SeqCst) {
            interval_timer.tick().await;

            if !running.load(Ordering::SeqCst) {
                break;
            }

            let results = join_all(kinds.iter().map(|kind| service.indicator(*kind))).await;
            for (kind, result) in kinds.iter().zip(results) {
                match result {
                    Ok(result) if result.is_valid() => {}
                    Ok(result) => debug!(%kind, error = result.error, "degraded sample"),
                    Err(e) => warn!(%kind, error = %e, "sampling failed"),
                }
            }
            rounds.fetch_add(1, Ordering::SeqCst);
        }
        debug!("sampling task exited");
    });

    handle
}
