mod cas;
mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use store::{InMemoryStore, SharedClaim, SharedTrip};

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;

use crate::model::*;
use crate::wal::Wal;

use store::{apply_to_claim, apply_to_trip};

/// Receiving end of an engine's change feed.
pub type MutationFeed = mpsc::UnboundedReceiver<Mutation>;

// ── Group-commit WAL writer ──────────────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that are already queued when the task wakes are
/// written as one batch and share a single fsync; control commands flush
/// whatever is batched before running.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut next = Some(first);
        while let Some(cmd) = next.take() {
            match cmd {
                WalCommand::Append { event, response } => batch.push((event, response)),
                control => {
                    commit_batch(&mut wal, &mut batch);
                    run_control(&mut wal, control);
                }
            }
            next = rx.try_recv().ok();
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut outcome = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't ride along
    // with the next batch.
    let flushed = wal.flush_sync();
    if outcome.is_ok() {
        outcome = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    for (_, response) in batch.drain(..) {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = response.send(reply);
    }
}

fn run_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::stage_compaction(wal.path(), &events)
                .and_then(|()| wal.install_compaction());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// Trips and claims for one tenant, made durable through the WAL.
///
/// Lock order for any writer touching several records: `write_gate` (shared),
/// then the trip, then the claim.
pub struct Engine {
    pub(super) records: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Writers hold it shared; compaction holds it exclusively so no append
    /// lands between its snapshot and the log swap.
    pub(super) write_gate: RwLock<()>,
    feed: mpsc::UnboundedSender<Mutation>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a Tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<(Self, MutationFeed)> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        let engine = Self {
            records: InMemoryStore::new(),
            wal_tx,
            write_gate: RwLock::new(()),
            feed: feed_tx,
        };
        for event in &events {
            engine.replay_one(event)?;
        }
        debug!("replayed {} WAL events from {}", events.len(), wal_path.display());
        Ok((engine, feed_rx))
    }

    /// Nothing else holds these locks during startup, so `try_write` cannot fail
    /// unless the log itself is inconsistent.
    fn replay_one(&self, event: &Event) -> io::Result<()> {
        let contended = || io::Error::other("replay: record unexpectedly locked");
        match event {
            Event::TripCreated { id, rider_id, at } => {
                self.records.insert_trip(Trip::new(*id, rider_id.clone(), *at));
            }
            Event::ClaimCreated { id, trip_id, driver_id, at } => {
                self.records.insert_claim(Claim::new(*id, *trip_id, driver_id.clone(), *at));
            }
            Event::TripStatusChanged { id, .. } => {
                if let Some(trip) = self.records.get_trip(id) {
                    apply_to_trip(&mut *trip.try_write().map_err(|_| contended())?, event);
                }
            }
            Event::ClaimAttempted { id, .. } | Event::ClaimDecided { id, .. } => {
                if let Some(claim) = self.records.get_claim(id) {
                    apply_to_claim(&mut *claim.try_write().map_err(|_| contended())?, event);
                }
            }
            Event::ClaimAccepted { id, trip_id, .. } => {
                if let Some(trip) = self.records.get_trip(trip_id) {
                    apply_to_trip(&mut *trip.try_write().map_err(|_| contended())?, event);
                }
                if let Some(claim) = self.records.get_claim(id) {
                    apply_to_claim(&mut *claim.try_write().map_err(|_| contended())?, event);
                }
            }
        }
        Ok(())
    }

    /// Hand `event` to the group-commit writer and wait until it is durable.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Publish a change. A dropped feed only means nobody is observing.
    pub(super) fn emit(&self, mutation: Mutation) {
        if self.feed.send(mutation).is_err() {
            debug!("mutation feed closed; change not observed");
        }
    }

    pub fn trip_count(&self) -> usize {
        self.records.trip_count()
    }
}
