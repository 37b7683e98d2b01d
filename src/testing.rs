//! Fixtures shared by unit tests: throwaway engines and `TripStore` /
//! `Notifier` fakes that misbehave on purpose.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, MutationFeed};
use crate::model::*;
use crate::notify::{Notifier, NotifyPayload, TemplateKind};
use crate::store::{ClaimCas, Decision, TripStore};

pub fn wal_path(group: &str, name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("triplock_test_{group}"));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

pub fn test_engine(group: &str, name: &str) -> (Arc<Engine>, MutationFeed) {
    let (engine, feed) = Engine::new(wal_path(group, name)).unwrap();
    (Arc::new(engine), feed)
}

/// A pending trip for `rider-1` with one pending claim per driver.
pub async fn trip_with_claims(engine: &Engine, drivers: &[&str]) -> (Ulid, Vec<Ulid>) {
    let trip_id = Ulid::new();
    engine.create_trip(trip_id, "rider-1".into()).await.unwrap();
    let mut claims = Vec::new();
    for driver in drivers {
        let claim_id = Ulid::new();
        engine.create_claim(claim_id, trip_id, driver.to_string()).await.unwrap();
        claims.push(claim_id);
    }
    (trip_id, claims)
}

/// Like `trip_with_claims`, with every claim already in `attempting_accept`.
pub async fn trip_with_attempts(engine: &Engine, drivers: &[&str]) -> (Ulid, Vec<Ulid>) {
    let (trip_id, claims) = trip_with_claims(engine, drivers).await;
    for claim_id in &claims {
        engine.request_accept(*claim_id).await.unwrap();
    }
    (trip_id, claims)
}

/// Sleeps between a transaction's reads and its commit.
pub struct SlowCommit {
    pub inner: Arc<Engine>,
    pub delay: Duration,
}

#[async_trait]
impl TripStore for SlowCommit {
    async fn load_trip(&self, id: Ulid) -> Result<Option<Trip>, EngineError> {
        self.inner.load_trip(id).await
    }

    async fn load_claim(&self, id: Ulid) -> Result<Option<Claim>, EngineError> {
        self.inner.load_claim(id).await
    }

    async fn compare_and_set(&self, cas: ClaimCas) -> Result<(), EngineError> {
        tokio::time::sleep(self.delay).await;
        self.inner.compare_and_set(cas).await
    }

    async fn pending_claims(&self, trip_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        self.inner.pending_claims(trip_id).await
    }

    async fn retire_claim(&self, claim_id: Ulid, decision: Decision) -> Result<bool, EngineError> {
        self.inner.retire_claim(claim_id, decision).await
    }
}

/// Every commit loses the race.
pub struct AlwaysConflict {
    pub inner: Arc<Engine>,
    pub commits: AtomicU32,
}

impl AlwaysConflict {
    pub fn new(inner: Arc<Engine>) -> Self {
        Self {
            inner,
            commits: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TripStore for AlwaysConflict {
    async fn load_trip(&self, id: Ulid) -> Result<Option<Trip>, EngineError> {
        self.inner.load_trip(id).await
    }

    async fn load_claim(&self, id: Ulid) -> Result<Option<Claim>, EngineError> {
        self.inner.load_claim(id).await
    }

    async fn compare_and_set(&self, cas: ClaimCas) -> Result<(), EngineError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Conflict(cas.trip_id))
    }

    async fn pending_claims(&self, trip_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        self.inner.pending_claims(trip_id).await
    }

    async fn retire_claim(&self, claim_id: Ulid, decision: Decision) -> Result<bool, EngineError> {
        self.inner.retire_claim(claim_id, decision).await
    }
}

/// The first `failures` sibling updates fail with a transient conflict.
pub struct FlakyRetire {
    pub inner: Arc<Engine>,
    failures: AtomicU32,
}

impl FlakyRetire {
    pub fn new(inner: Arc<Engine>, failures: u32) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl TripStore for FlakyRetire {
    async fn load_trip(&self, id: Ulid) -> Result<Option<Trip>, EngineError> {
        self.inner.load_trip(id).await
    }

    async fn load_claim(&self, id: Ulid) -> Result<Option<Claim>, EngineError> {
        self.inner.load_claim(id).await
    }

    async fn compare_and_set(&self, cas: ClaimCas) -> Result<(), EngineError> {
        self.inner.compare_and_set(cas).await
    }

    async fn pending_claims(&self, trip_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        self.inner.pending_claims(trip_id).await
    }

    async fn retire_claim(&self, claim_id: Ulid, decision: Decision) -> Result<bool, EngineError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EngineError::Conflict(claim_id));
        }
        self.inner.retire_claim(claim_id, decision).await
    }
}

/// Remembers every notification; reports `delivered` for all of them.
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, TemplateKind, NotifyPayload)>>,
    delivered: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            delivered: true,
        }
    }

    /// A notifier whose every delivery fails.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            delivered: false,
        }
    }

    pub fn kinds_for(&self, recipient: &str) -> Vec<TemplateKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _, _)| to == recipient)
            .map(|(_, kind, _)| *kind)
            .collect()
    }

    pub fn count(&self, kind: TemplateKind) -> usize {
        self.sent.lock().unwrap().iter().filter(|(_, k, _)| *k == kind).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, recipient: &str, kind: TemplateKind, payload: &NotifyPayload) -> bool {
        self.sent.lock().unwrap().push((recipient.to_string(), kind, payload.clone()));
        self.delivered
    }
}
