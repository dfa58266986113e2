//! Hard caps on input sizes. Anything above these is rejected with
//! `EngineError::LimitExceeded` before touching state.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_PROVIDERS_PER_TENANT: usize = 100_000;
pub const MAX_SLUG_LEN: usize = 64;
pub const MAX_TIMEZONE_LEN: usize = 64;

pub const MAX_PATTERNS_PER_SCOPE: usize = 512;
pub const MAX_SLOTS_PER_SCOPE: usize = 20_000;

/// Rolling generation horizon upper bound.
pub const MAX_HORIZON_DAYS: u32 = 366;

pub const MAX_HOLDER_TOKEN_LEN: usize = 128;
pub const MAX_HOLD_TTL_MS: Ms = 60 * 60 * 1000;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_NOTES_LEN: usize = 4_000;

/// Session durations must fit inside one day.
pub const MAX_SESSION_DURATION_MS: Ms = 24 * 60 * 60 * 1000;
