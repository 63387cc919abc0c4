//! Hard caps and scheduling policy constants. Structural caps bound memory
//! and worst-case latency per request; policy constants are the business
//! rules the engine enforces.

use chrono::Weekday;

use crate::model::Mins;

// ── Structural caps ──────────────────────────────────────────────

pub const MAX_TENANTS: usize = 64;
pub const MAX_TENANT_NAME_LEN: usize = 128;
pub const MAX_PROVIDERS_PER_TENANT: usize = 500;
pub const MAX_RULES_PER_PROVIDER: usize = 256;
pub const MAX_HOLDS_PER_PROVIDER: usize = 512;
pub const MAX_BOOKINGS_PER_PROVIDER: usize = 20_000;
pub const MAX_ENROLLMENTS_PER_TENANT: usize = 50_000;
pub const MAX_NAME_LEN: usize = 120;
pub const MAX_ACTOR_LEN: usize = 120;
pub const MAX_EXTERNAL_ID_LEN: usize = 256;

/// Largest accepted wire frame (one JSON request per line).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Dates outside this range are rejected as malformed input.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

// ── Slot generation policy ───────────────────────────────────────

/// Horizon cap: no slot query may look further ahead than this.
pub const MAX_HORIZON_DAYS: u32 = 60;
pub const DEFAULT_HORIZON_DAYS: u32 = 14;

/// Providers scanned by one aggregate (provider-agnostic) query.
pub const MAX_PROVIDERS_PER_QUERY: usize = 64;

/// Candidate slots start on this grid.
pub const SLOT_GRID_MINUTES: Mins = 30;

/// Same-day candidates inside this buffer from "now" are not offered.
pub const LEAD_TIME_MINUTES: Mins = 120;

/// Fallback working window for a provider with zero configured rules.
pub const DEFAULT_DAY_START: Mins = 8 * 60;
pub const DEFAULT_DAY_END: Mins = 20 * 60;

/// Globally non-working days, vetoed regardless of weekly rules.
pub const NON_WORKING_DAYS: &[Weekday] = &[Weekday::Sun];

// ── Session durations ────────────────────────────────────────────

/// Coaching duration by client age bracket.
pub const COACHING_CHILD_MAX_AGE: u32 = 11;
pub const COACHING_TEEN_MAX_AGE: u32 = 17;
pub const COACHING_CHILD_MINUTES: Mins = 30;
pub const COACHING_TEEN_MINUTES: Mins = 45;
pub const COACHING_ADULT_MINUTES: Mins = 60;
pub const INTAKE_MINUTES: Mins = 20;
pub const CHECK_IN_MINUTES: Mins = 15;

// ── Hold policy ──────────────────────────────────────────────────

/// TTL bounds: long enough to finish checkout, short enough to deter
/// slot squatting.
pub const MIN_HOLD_TTL_MS: i64 = 30_000;
pub const MAX_HOLD_TTL_MS: i64 = 600_000;
pub const DEFAULT_HOLD_TTL_MS: i64 = 180_000;

// ── Enrollment pause policy ──────────────────────────────────────

pub const MAX_PAUSE_COUNT: u32 = 3;
pub const MAX_PAUSE_DAYS_SINGLE: i64 = 30;
pub const MAX_PAUSE_DAYS_TOTAL: i64 = 60;
pub const MIN_PAUSE_NOTICE_HOURS: i64 = 48;

pub const MIN_PROGRAM_DAYS: i64 = 1;
pub const MAX_PROGRAM_DAYS: i64 = 730;
