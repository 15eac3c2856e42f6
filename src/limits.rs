/// Max length of a resource identifier.
pub const MAX_RESOURCE_ID_LEN: usize = 64;

/// Max length of an optional caller identity.
pub const MAX_USER_ID_LEN: usize = 128;

/// Upper bound for the configured per-resource capacity.
pub const MAX_CAPACITY: u32 = 10_000;

/// Upper bound for the configured lease TTL (one day).
pub const MAX_TTL_SECONDS: u32 = 86_400;

/// Resources one tenant may track at once.
pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;

pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_TENANTS: usize = 64;

/// Rate-limit windows kept before stale ones are pruned.
pub const MAX_TRACKED_CALLERS: usize = 50_000;

/// Expired rows outlive the background sweep by this much of the store's own clock, so a
/// caller whose clock lags the store never sees its live lease swept away.
pub const REAP_GRACE_MS: i64 = 300_000;

/// Timestamps accepted on the store wire protocol (2000-01-01 .. 2100-01-01).
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: i64 = 4_102_444_800_000;
