use crate::model::Ms;

// ── Tenancy ──────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Records ──────────────────────────────────────────────────────

pub const MAX_TRIPS_PER_TENANT: usize = 1_000_000;
pub const MAX_CLAIMS_PER_TRIP: usize = 512;
pub const MAX_USER_ID_LEN: usize = 128;

// ── Wire ─────────────────────────────────────────────────────────

/// Longest accepted request line, in bytes (newline excluded).
pub const MAX_FRAME_LEN: usize = 64 * 1024;
pub const MAX_NOTIFICATION_TEXT_LEN: usize = 1024;
pub const MAX_LISTENS_PER_CONNECTION: usize = 64;

// ── Resolution ───────────────────────────────────────────────────

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BASE_MS: u64 = 5;
pub const MAX_RETRY_DELAY_MS: u64 = 250;

// ── Background work ──────────────────────────────────────────────

/// Pending claims older than this are expired by the reaper.
pub const DEFAULT_CLAIM_TTL_MS: Ms = 120_000;
/// Claims stuck in `attempting_accept` longer than this are redelivered.
pub const DEFAULT_REDELIVERY_AFTER_MS: Ms = 10_000;
pub const REAPER_INTERVAL_MS: u64 = 5_000;
pub const COMPACTOR_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1_000;
