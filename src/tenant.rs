use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper::{self, ReaperSettings};
use crate::resolver::RetryPolicy;
use crate::trigger;

/// Per-tenant tunables, shared by every tenant of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub claim_ttl_ms: i64,
    pub redelivery_after_ms: i64,
    pub retry: RetryPolicy,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            claim_ttl_ms: DEFAULT_CLAIM_TTL_MS,
            redelivery_after_ms: DEFAULT_REDELIVERY_AFTER_MS,
            retry: RetryPolicy::default(),
        }
    }
}

/// One tenant's state: its engine and the hub its users listen on.
pub struct Tenant {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
}

/// Manages per-tenant engines. Each tenant gets its own engine, WAL,
/// dispatcher, reaper and compactor.
pub struct TenantManager {
    tenants: DashMap<String, Arc<Tenant>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            tenants: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Get or lazily create the given tenant.
    ///
    /// Tenants are keyed by the sanitized name that also names the WAL file,
    /// so two spellings that map to one file share one engine.
    pub fn get_or_create(&self, name: &str) -> std::io::Result<Arc<Tenant>> {
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // Keep the WAL inside data_dir whatever the client sends.
        let safe_name: String = name
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if let Some(tenant) = self.tenants.get(&safe_name) {
            return Ok(tenant.value().clone());
        }
        if self.tenants.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Replay outside the map's shard lock. A racing opener of the same
        // tenant may win; ours is then dropped before any task starts.
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let (engine, feed) = Engine::new(wal_path)?;
        let entry = match self.tenants.entry(safe_name) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(vacant) => vacant,
        };

        let engine = Arc::new(engine);
        let hub = Arc::new(NotifyHub::new());
        let settings = self.settings;

        tokio::spawn(trigger::run_dispatcher(engine.clone(), feed, hub.clone(), settings.retry));
        tokio::spawn(reaper::run_reaper(
            engine.clone(),
            hub.clone(),
            ReaperSettings {
                claim_ttl_ms: settings.claim_ttl_ms,
                redelivery_after_ms: settings.redelivery_after_ms,
                retry: settings.retry,
            },
        ));
        tokio::spawn(reaper::run_compactor(engine.clone(), settings.compact_threshold));

        let tenant = Arc::new(Tenant { engine, hub });
        entry.insert(tenant.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.tenants.len() as f64);
        Ok(tenant)
    }
}
