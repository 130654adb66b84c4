//! Time-based decay of edge and trajectory counters.
//!
//! Frequencies erode exponentially with the time since an edge was last
//! observed, and weights are recomputed from the decayed frequency:
//!
//! ```text
//! freq'   = round(freq · e^(−Δt / (half_life_days · 86400)))
//! weight' = 1 − e^(−α · freq')
//! ```
//!
//! A pass never advances `last_seen`; only ingestion does. Repeated passes
//! therefore compound from the original observation time.
//!
//! [`DecayMaintainer`] runs passes on a fixed interval until shut down. A
//! failed pass is logged and retried on the next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::store::{DecayReport, Store};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayParams {
    pub alpha: f64,
    pub half_life_days: f64,
}

/// `1 − e^(−α·freq)`, zero for non-positive frequencies.
///
/// Strictly increasing in `freq` until the result rounds to 1.0 in `f64`
/// (around `α·freq ≈ 37`).
pub fn weight_for_freq(alpha: f64, freq: i64) -> f64 {
    if freq <= 0 {
        return 0.0;
    }
    -(-alpha * freq as f64).exp_m1()
}

/// Frequency after `elapsed_secs` of decay. Negative elapsed time counts as
/// zero; the result is never negative.
pub fn decayed_freq(freq: i64, elapsed_secs: i64, half_life_days: f64) -> i64 {
    if freq <= 0 {
        return 0;
    }
    let dt = elapsed_secs.max(0) as f64;
    let factor = (-dt / (half_life_days * SECONDS_PER_DAY)).exp();
    (freq as f64 * factor).round().max(0.0) as i64
}

/// New `(freq, weight)` for one row, or `None` when nothing changes.
pub fn decay_row(
    params: &DecayParams,
    freq: i64,
    weight: f64,
    last_seen: i64,
    now: i64,
) -> Option<(i64, f64)> {
    let new_freq = decayed_freq(freq, now - last_seen, params.half_life_days);
    let new_weight = weight_for_freq(params.alpha, new_freq);
    if new_freq == freq && (new_weight - weight).abs() <= f64::EPSILON {
        None
    } else {
        Some((new_freq, new_weight))
    }
}

/// Recurring decay task over an injected store.
pub struct DecayMaintainer {
    store: Arc<dyn Store>,
    params: DecayParams,
    interval: Duration,
}

impl DecayMaintainer {
    pub fn new(store: Arc<dyn Store>, params: DecayParams, interval: Duration) -> Self {
        Self {
            store,
            params,
            interval,
        }
    }

    /// Run a single pass as of the current wall-clock time.
    pub async fn run_pass(&self) -> Result<DecayReport> {
        let now = Utc::now().timestamp();
        let report = self.store.decay(&self.params, now).await?;
        info!(
            edges_scanned = report.edges_scanned,
            edges_updated = report.edges_updated,
            trajectories_scanned = report.trajectories_scanned,
            trajectories_updated = report.trajectories_updated,
            "Decay pass complete"
        );
        Ok(report)
    }

    /// Run passes every interval until `shutdown` resolves. The first pass
    /// starts immediately; a pass in progress always completes.
    pub async fn run<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        tokio::pin!(shutdown);
        let mut passes = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(passes, "Decay maintainer stopping");
                    return passes;
                }
                _ = ticker.tick() => {
                    passes += 1;
                    if let Err(e) = self.run_pass().await {
                        warn!(error = %e, "Decay pass failed, retrying next interval");
                    }
                }
            }
        }
    }
}
