//! Store key layout for a pool
//!
//! | Structure              | Key                   |
//! |------------------------|-----------------------|
//! | available list         | `P`                   |
//! | leased list            | `P:used`              |
//! | available index (set)  | `P:available_index`   |
//! | leased index (set)     | `P:used_index`        |
//! | cooldown (sorted set)  | `P:cooldown`          |

/// The five keys backing a single pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolKeys {
    pub available: String,
    pub leased: String,
    pub available_index: String,
    pub leased_index: String,
    pub cooldown: String,
}

impl PoolKeys {
    pub fn new(pool: &str) -> Self {
        Self {
            available: pool.to_string(),
            leased: format!("{pool}:used"),
            available_index: format!("{pool}:available_index"),
            leased_index: format!("{pool}:used_index"),
            cooldown: format!("{pool}:cooldown"),
        }
    }

    /// Pool name (the available list key).
    pub fn pool(&self) -> &str {
        &self.available
    }

    /// All five keys, in the order they are wiped on save/rebuild.
    pub fn all(&self) -> [&str; 5] {
        [
            &self.available,
            &self.leased,
            &self.available_index,
            &self.leased_index,
            &self.cooldown,
        ]
    }
}
