//! Stored record encoding
//!
//! Accounts are stored as flat JSON objects:
//!
//! ```json
//! {"username":"a","password":"p","in_use":false,"created_at":1700000000.0,
//!  "acquired_at":null,"released_at":1700000100.0,"cooldown_until":null}
//! ```
//!
//! The lease scripts running inside the store rewrite these objects too, so the
//! format is shared with them: optional timestamps are omitted when absent, and
//! fields this crate does not know about survive a decode/encode cycle.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::account::{Account, LeaseState};
use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    username: String,
    password: String,
    #[serde(default)]
    in_use: bool,
    #[serde(default)]
    created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquired_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    released_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<f64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// Serialize an account to its stored form.
pub fn encode(account: &Account) -> Result<String> {
    let (in_use, acquired_at, cooldown_until) = match account.state {
        LeaseState::Available => (false, None, None),
        LeaseState::Leased { acquired_at } => (true, acquired_at, None),
        LeaseState::CoolingDown { until } => (false, None, Some(until)),
    };
    let record = Record {
        username: account.username.clone(),
        password: account.password.expose().clone(),
        in_use,
        created_at: account.created_at,
        acquired_at,
        released_at: account.released_at,
        cooldown_until,
        extra: account.extra.clone(),
    };
    serde_json::to_string(&record).map_err(|e| Error::Codec(format!("encoding {}: {e}", account.username)))
}

/// Parse a stored record.
///
/// The state is derived from the record's own flags: `in_use` wins, then a
/// present `cooldown_until`, otherwise available. Callers that know which
/// structure the record came from relabel it afterwards.
pub fn decode(payload: &str) -> Result<Account> {
    let record: Record =
        serde_json::from_str(payload).map_err(|e| Error::Codec(format!("malformed record: {e}")))?;
    if record.username.trim().is_empty() {
        return Err(Error::Codec("record has an empty username".into()));
    }

    let state = if record.in_use {
        LeaseState::Leased {
            acquired_at: record.acquired_at,
        }
    } else if let Some(until) = record.cooldown_until {
        LeaseState::CoolingDown { until }
    } else {
        LeaseState::Available
    };

    Ok(Account {
        username: record.username,
        password: record.password.into(),
        created_at: record.created_at,
        released_at: record.released_at,
        state,
        extra: record.extra,
    })
}

/// Decode, or log and skip a malformed entry read from `source`.
pub(crate) fn decode_or_skip(payload: &str, source: &str) -> Option<Account> {
    match decode(payload) {
        Ok(account) => Some(account),
        Err(e) => {
            warn!(key = source, error = %e, payload, "skipping unreadable account entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Secret;

    #[test]
    fn available_account_omits_lease_fields() {
        let account = Account::new("alice", Secret::from("pw"), 1_700_000_000.5);
        let encoded = encode(&account).unwrap();
        let json: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(json["username"], "alice");
        assert_eq!(json["password"], "pw");
        assert_eq!(json["in_use"], false);
        assert_eq!(json["created_at"], 1_700_000_000.5);
        assert!(json.get("acquired_at").is_none());
        assert!(json.get("cooldown_until").is_none());
    }

    #[test]
    fn leased_and_cooling_states_survive_encoding() {
        let leased = Account::new("a", Secret::from("p"), 1.0).leased(10.0);
        let decoded = decode(&encode(&leased).unwrap()).unwrap();
        assert_eq!(
            decoded.state(),
            LeaseState::Leased {
                acquired_at: Some(10.0)
            }
        );

        let cooling = leased.released(20.0, 5);
        let decoded = decode(&encode(&cooling).unwrap()).unwrap();
        assert_eq!(decoded.cooldown_until(), Some(25.0));
        assert_eq!(decoded.released_at(), Some(20.0));
    }

    #[test]
    fn unknown_fields_are_preserved() {
        let payload = r#"{"username":"u","password":"p","in_use":false,"created_at":1,"region":"eu","tier":3}"#;
        let account = decode(payload).unwrap();
        assert_eq!(account.extra()["region"], "eu");

        let json: serde_json::Value = serde_json::from_str(&encode(&account).unwrap()).unwrap();
        assert_eq!(json["region"], "eu");
        assert_eq!(json["tier"], 3);
    }

    #[test]
    fn tolerates_nulls_and_integer_timestamps() {
        // Shape written by older tooling: explicit nulls and integer seconds.
        let payload = r#"{"username":"u","password":"p","in_use":true,"created_at":1700000000,"acquired_at":1700000050,"released_at":null,"cooldown_until":null}"#;
        let account = decode(payload).unwrap();
        assert_eq!(account.acquired_at(), Some(1_700_000_050.0));
        assert!(account.released_at().is_none());
    }

    #[test]
    fn in_use_flag_wins_over_cooldown() {
        let payload = r#"{"username":"u","password":"p","in_use":true,"cooldown_until":99}"#;
        let account = decode(payload).unwrap();
        assert!(account.state().is_leased());
        assert!(account.cooldown_until().is_none());
    }

    #[test]
    fn rejects_malformed_records() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"password":"p"}"#).is_err());
        assert!(decode(r#"{"username":"","password":"p"}"#).is_err());
        assert!(decode(r#"{"username":"u"}"#).is_err());
        assert!(decode(r#"["u","p"]"#).is_err());
    }

    #[test]
    fn decode_or_skip_swallows_errors() {
        assert!(decode_or_skip("{broken", "pool").is_none());
        assert!(decode_or_skip(r#"{"username":"u","password":"p"}"#, "pool").is_some());
    }
}
