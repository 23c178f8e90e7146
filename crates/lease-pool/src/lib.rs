//! Distributed account leasing over a shared key-value store
//!
//! A pool is a named set of accounts that callers check out for exclusive use.
//! Any number of processes on any number of hosts may lease from the same pool
//! at once; exclusivity is enforced entirely by the store's atomic primitives,
//! never by in-process locks.
//!
//! Account lifecycle:
//! 1. `save` wipes the pool and stores the supplied accounts as available
//! 2. `acquire` pops the head of the available list and marks it leased
//! 3. `release` returns it to the tail of the available list, or quarantines it
//!    in the cooldown set for a number of seconds
//! 4. Expired cooldowns are promoted back to available before every operation
//! 5. Leases held past a timeout are reclaimed into cooldown by `cleanup_expired`
//!
//! The available and leased lists are mirrored by username index sets. When an
//! index disagrees with its list the whole pool is rebuilt from the lists and
//! the cooldown set.

pub mod account;
pub mod clock;
pub mod codec;
pub mod error;
pub mod keys;
pub mod maintenance;
mod metrics;
pub mod pool;
pub mod reaper;
pub mod repair;
pub mod state;
pub mod store;

pub use account::{Account, AccountSeed, LeaseState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use keys::PoolKeys;
pub use maintenance::spawn_maintenance_task;
pub use pool::{DedupReport, LeaseCoordinator, DEFAULT_ABANDONED_COOLDOWN_SECS};
pub use state::PoolCounts;
pub use store::{MemoryStore, RedisSettings, RedisStore, Store};
