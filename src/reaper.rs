use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::fanout::{retire_all, supersede};
use crate::limits::{COMPACTOR_INTERVAL_MS, REAPER_INTERVAL_MS};
use crate::model::*;
use crate::notify::{Notifier, TemplateKind};
use crate::observability;
use crate::resolver::RetryPolicy;
use crate::store::Decision;

/// Timing knobs for one tenant's reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaperSettings {
    pub claim_ttl_ms: Ms,
    pub redelivery_after_ms: Ms,
    pub retry: RetryPolicy,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub superseded: usize,
    pub expired: usize,
    pub redelivered: usize,
}

/// One pass:
/// 1. finish fan-outs and cancellations that left claims `pending` on a trip
///    that already moved on;
/// 2. expire pending claims older than the TTL;
/// 3. re-emit accept attempts nobody decided within the redelivery window.
///
/// Step 1 runs first so a loser of a won trip ends `superseded`, not timed out.
pub async fn sweep<N: Notifier + ?Sized>(
    engine: &Engine,
    notifier: &N,
    settings: &ReaperSettings,
    now: Ms,
) -> Sweep {
    let mut superseded = 0;
    let mut expired = 0;
    for (trip, pending) in engine.collect_stranded_pending().await {
        match trip.accepted_claim_id {
            Some(winner) => {
                match supersede(engine, notifier, &settings.retry, trip.id, winner).await {
                    Ok(moved) => superseded += moved,
                    Err(e) => warn!("trip {}: repairing fan-out failed: {e}", trip.id),
                }
            }
            // Only a cancellation takes a trip out of `pending` without a winner.
            None => {
                expired += retire_all(
                    engine,
                    notifier,
                    &settings.retry,
                    &pending,
                    TemplateKind::ClaimExpired,
                    || Decision::expired(REASON_TRIP_CANCELLED, now_ms()),
                )
                .await;
            }
        }
    }
    if superseded > 0 {
        warn!("superseded {superseded} claims left behind by an unfinished fan-out");
    }

    let stale = engine.collect_stale_pending(now, settings.claim_ttl_ms).await;
    expired += retire_all(
        engine,
        notifier,
        &settings.retry,
        &stale,
        TemplateKind::ClaimExpired,
        || Decision::expired(REASON_TIMED_OUT, now_ms()),
    )
    .await;
    if expired > 0 {
        info!("expired {expired} claims");
        metrics::counter!(observability::CLAIMS_EXPIRED_TOTAL).increment(expired as u64);
    }

    let mut redelivered = 0;
    for claim in engine.collect_stalled_attempts(now, settings.redelivery_after_ms).await {
        if engine.redeliver(claim.id).await {
            debug!("redelivered accept attempt {}", claim.id);
            redelivered += 1;
        }
    }
    if redelivered > 0 {
        warn!("redelivered {redelivered} undecided accept attempts");
        metrics::counter!(observability::REDELIVERIES_TOTAL).increment(redelivered as u64);
    }
    Sweep {
        superseded,
        expired,
        redelivered,
    }
}

/// Background task that periodically sweeps stale claims.
pub async fn run_reaper<N>(engine: Arc<Engine>, notifier: Arc<N>, settings: ReaperSettings)
where
    N: Notifier + ?Sized,
{
    let mut interval = tokio::time::interval(Duration::from_millis(REAPER_INTERVAL_MS));
    loop {
        interval.tick().await;
        sweep(&engine, &*notifier, &settings, now_ms()).await;
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(COMPACTOR_INTERVAL_MS));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
