//! Account record and lease state machine
//!
//! An `Account` is an immutable value: every transition consumes the record and
//! returns the relabeled copy that gets written back to the store. Which of the
//! three pool structures a record lives in is mirrored by its `LeaseState`, so
//! combinations such as "in use and cooling down" cannot be expressed.

use common::Secret;
use serde::{Deserialize, Deserializer};

/// Lease state of a pool account.
///
/// Transitions:
/// - Available → Leased (acquire)
/// - Leased → Available (release without cooldown)
/// - Leased → CoolingDown (release with cooldown, expired-lease cleanup)
/// - CoolingDown → Available (cooldown reaped)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeaseState {
    Available,
    /// `acquired_at` is absent only for records written by something other than
    /// the acquire transition; such leases never time out on their own.
    Leased { acquired_at: Option<f64> },
    CoolingDown { until: f64 },
}

impl LeaseState {
    /// Status label used in listings and logs.
    pub fn label(&self) -> &'static str {
        match self {
            LeaseState::Available => "available",
            LeaseState::Leased { .. } => "in_use",
            LeaseState::CoolingDown { .. } => "cooldown",
        }
    }

    pub fn is_leased(&self) -> bool {
        matches!(self, LeaseState::Leased { .. })
    }
}

/// A leasable account record.
#[derive(Debug, Clone)]
pub struct Account {
    pub(crate) username: String,
    pub(crate) password: Secret<String>,
    pub(crate) created_at: f64,
    pub(crate) released_at: Option<f64>,
    pub(crate) state: LeaseState,
    /// Fields this version does not know about, carried through untouched.
    pub(crate) extra: serde_json::Map<String, serde_json::Value>,
}

impl Account {
    /// A fresh, available account.
    pub fn new(username: impl Into<String>, password: Secret<String>, created_at: f64) -> Self {
        Self {
            username: username.into(),
            password,
            created_at,
            released_at: None,
            state: LeaseState::Available,
            extra: serde_json::Map::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &Secret<String> {
        &self.password
    }

    pub fn created_at(&self) -> f64 {
        self.created_at
    }

    pub fn released_at(&self) -> Option<f64> {
        self.released_at
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    pub fn acquired_at(&self) -> Option<f64> {
        match self.state {
            LeaseState::Leased { acquired_at } => acquired_at,
            _ => None,
        }
    }

    pub fn cooldown_until(&self) -> Option<f64> {
        match self.state {
            LeaseState::CoolingDown { until } => Some(until),
            _ => None,
        }
    }

    /// Unknown fields preserved from the stored record.
    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }

    /// Available → Leased.
    pub fn leased(self, now: f64) -> Self {
        Self {
            released_at: None,
            state: LeaseState::Leased {
                acquired_at: Some(now),
            },
            ..self
        }
    }

    /// Leased → Available, or Leased → CoolingDown when `cooldown_secs > 0`.
    pub fn released(self, now: f64, cooldown_secs: u64) -> Self {
        let state = if cooldown_secs > 0 {
            LeaseState::CoolingDown {
                until: now + cooldown_secs as f64,
            }
        } else {
            LeaseState::Available
        };
        Self {
            released_at: Some(now),
            state,
            ..self
        }
    }

    /// CoolingDown → Available.
    pub fn cooled_down(self) -> Self {
        Self {
            state: LeaseState::Available,
            ..self
        }
    }

    /// Force the state implied by the structure the record was found in.
    ///
    /// Used when rebuilding the pool: the structure is authoritative, the
    /// flags inside the record are not.
    pub(crate) fn relabeled(self, state: LeaseState) -> Self {
        Self { state, ..self }
    }
}

/// Input to a bulk save: one row as supplied by an operator.
///
/// Both fields default to empty, whether missing or null, so that incomplete
/// rows can be reported and dropped instead of failing the whole request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountSeed {
    #[serde(default, deserialize_with = "null_as_default")]
    pub username: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub password: Secret<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl AccountSeed {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Secret::new(password.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::new("alice", Secret::from("pw"), 100.0)
    }

    #[test]
    fn new_account_is_available() {
        let a = account();
        assert_eq!(a.state(), LeaseState::Available);
        assert_eq!(a.state().label(), "available");
        assert!(a.acquired_at().is_none());
        assert!(a.cooldown_until().is_none());
    }

    #[test]
    fn lease_stamps_acquired_at_and_clears_release() {
        let a = account().released(150.0, 0).leased(200.0);
        assert_eq!(a.acquired_at(), Some(200.0));
        assert!(a.released_at().is_none());
        assert!(a.state().is_leased());
        assert_eq!(a.state().label(), "in_use");
    }

    #[test]
    fn release_without_cooldown_is_available() {
        let a = account().leased(200.0).released(260.0, 0);
        assert_eq!(a.state(), LeaseState::Available);
        assert_eq!(a.released_at(), Some(260.0));
        assert!(a.acquired_at().is_none());
    }

    #[test]
    fn release_with_cooldown_sets_ready_time() {
        let a = account().leased(200.0).released(260.0, 30);
        assert_eq!(a.cooldown_until(), Some(290.0));
        assert_eq!(a.state().label(), "cooldown");
    }

    #[test]
    fn cooled_down_keeps_release_stamp() {
        let a = account().leased(200.0).released(260.0, 30).cooled_down();
        assert_eq!(a.state(), LeaseState::Available);
        assert_eq!(a.released_at(), Some(260.0));
    }

    #[test]
    fn seed_treats_null_fields_as_empty() {
        let rows: Vec<AccountSeed> = serde_json::from_str(
            r#"[{"username":"good","password":"pw"},{"username":"bad","password":null},{"username":null}]"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].password.expose(), "pw");
        assert!(rows[1].password.is_blank());
        assert!(rows[2].username.is_empty());
        assert!(rows[2].password.is_blank());
    }

    #[test]
    fn seed_debug_redacts_password() {
        let seed = AccountSeed::new("bob", "s3cret");
        let debug = format!("{seed:?}");
        assert!(debug.contains("bob"));
        assert!(!debug.contains("s3cret"));
    }
}
