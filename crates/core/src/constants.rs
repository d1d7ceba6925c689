//! Tunables shared by the sync engine and the intersection engine.

/// Largest candidate list bound into a single membership query.
///
/// SQL engines cap the number of bound parameters per statement; larger
/// candidate sets are split into consecutive chunks of this size.
pub const MEMBERSHIP_CHUNK_SIZE: usize = 10_000;

/// Blocks advanced per pass when more than this many blocks behind.
pub const FAR_BEHIND_THRESHOLD: u64 = 1_000;

/// Blocks advanced per pass when between [`MID_BEHIND_THRESHOLD`] and
/// [`FAR_BEHIND_THRESHOLD`] blocks behind.
pub const MID_BEHIND_THRESHOLD: u64 = 100;

/// Below or at this distance, the pass is a single one-block call.
pub const NEAR_BEHIND_THRESHOLD: u64 = 10;

/// Block numbers per upstream call while catching up.
pub const BLOCKS_PER_QUERY: u64 = 5;

/// Default number of attempts for an upstream call (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default upstream calls per second within one pass.
pub const DEFAULT_REQUESTS_PER_SECOND: u32 = 2;

/// Default sync lease lifetime in seconds.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 600;
