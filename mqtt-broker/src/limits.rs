//! Fixed capacities and timing constants.
//!
//! Every bound here is deliberately small and deliberately a compile-time
//! constant: the broker trades a hash map's amortized lookup for a linear
//! scan over a table whose size is capped well below where that trade stops
//! paying off.

use std::time::Duration;

pub const MAX_CLIENTS: usize = 128;
pub const MAX_SUBS_PER_CLIENT: usize = 32;
pub const MAX_RETAINED: usize = 256;
pub const MAX_INFLIGHT: usize = 16;
pub const RX_BUF_SIZE: usize = 64 * 1024;
pub const SCRATCH_SIZE: usize = 64 * 1024;
pub const MAX_SUBSCRIBE_FILTERS: usize = 64;

pub const DEFAULT_PORT: u16 = 1883;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Keep-alive grace period is `1.5 * keep_alive`; expressed as a ratio to
/// avoid floating point on the hot path.
pub fn keep_alive_deadline_secs(keep_alive_secs: u16) -> u64 {
    let k = u64::from(keep_alive_secs);
    k + k / 2
}
