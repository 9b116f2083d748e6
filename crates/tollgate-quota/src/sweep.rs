//! Background reservation sweep.
//!
//! A node that crashes between admit and reconcile leaves its reservation
//! open and its provisional additions counted. The sweep bounds that
//! staleness: any reservation still open past the deadline is treated as
//! release-on-timeout and its additions returned.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tollgate_common::{config::LimiterConfig, UnixMillis};
use tracing::{debug, warn};

use crate::store::{CounterStore, StoreError};
use crate::window::now_unix_ms;

/// Upper bound on reservations released per pass; a backlog larger than this
/// drains over subsequent passes.
const SWEEP_BATCH: usize = 128;

/// Periodic reaper of abandoned reservations.
pub struct Sweeper {
    store: Arc<dyn CounterStore>,
    deadline_ms: u64,
    interval: Duration,
}

impl Sweeper {
    /// Build a sweeper from limiter configuration.
    pub fn new(store: Arc<dyn CounterStore>, config: &LimiterConfig) -> Self {
        Self {
            store,
            deadline_ms: config.sweep_secs * 1_000,
            interval: Duration::from_secs(config.sweep_interval_secs),
        }
    }

    /// Run one pass at instant `now`, releasing reservations whose admission
    /// is older than the deadline. Returns how many were released.
    pub async fn sweep_once(&self, now: UnixMillis) -> Result<usize, StoreError> {
        let cutoff = now.saturating_sub(self.deadline_ms);
        let stale = self
            .store
            .open_reservations_older_than(cutoff, SWEEP_BATCH)
            .await?;

        let mut released = 0;
        for id in stale {
            match self.store.release(&id, now).await {
                Ok(outcome) if outcome.applied => {
                    warn!(reservation = %id, "released reservation left open past sweep deadline");
                    metrics::counter!("tollgate_sweep_released_total").increment(1);
                    released += 1;
                }
                Ok(_) => {
                    // Settled between scan and release; nothing to do.
                }
                Err(err) => {
                    warn!(reservation = %id, error = %err, "sweep release failed, will retry next pass");
                }
            }
        }
        Ok(released)
    }

    /// Spawn the periodic sweep loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.sweep_once(now_unix_ms()).await {
                    Ok(0) => {}
                    Ok(released) => debug!(released, "sweep pass complete"),
                    Err(err) => warn!(error = %err, "sweep pass failed"),
                }
            }
        })
    }
}
