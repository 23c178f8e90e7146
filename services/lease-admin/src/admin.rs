//! Admin API for pool management
//!
//! Operator-facing endpoints over the lease coordinator. Every handler works on
//! the pool named in the path, so one instance can manage any pool in the
//! store, not only the one it maintains.
//!
//! Endpoints:
//! - GET  /admin/pools/{pool}               record counts per structure
//! - GET  /admin/pools/{pool}/accounts      list accounts with status (no passwords)
//! - PUT  /admin/pools/{pool}/accounts      replace the pool with the given accounts
//! - POST /admin/pools/{pool}/acquire       lease one account
//! - POST /admin/pools/{pool}/release       return a leased account
//! - POST /admin/pools/{pool}/cleanup       reclaim leases held past a timeout
//! - POST /admin/pools/{pool}/release-all   return every leased account
//! - POST /admin/pools/{pool}/dedup         rebuild the pool, dropping duplicates

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use lease_pool::{Account, AccountSeed, DedupReport, LeaseCoordinator, PoolCounts, Store};

use crate::error::{Error, Result};

/// Shared state for admin API handlers.
pub struct AdminState<S> {
    coordinator: Arc<LeaseCoordinator<S>>,
    lease_timeout: Duration,
}

impl<S> Clone for AdminState<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: Arc::clone(&self.coordinator),
            lease_timeout: self.lease_timeout,
        }
    }
}

impl<S: Store> AdminState<S> {
    /// `lease_timeout` is used by cleanup requests that do not name one.
    pub fn new(coordinator: Arc<LeaseCoordinator<S>>, lease_timeout: Duration) -> Self {
        Self {
            coordinator,
            lease_timeout,
        }
    }
}

/// Build the admin axum router with all pool management endpoints.
pub fn build_admin_router<S: Store>(state: AdminState<S>) -> Router {
    Router::new()
        .route("/admin/pools/{pool}", get(pool_status::<S>))
        .route(
            "/admin/pools/{pool}/accounts",
            get(list_accounts::<S>).put(save_accounts::<S>),
        )
        .route("/admin/pools/{pool}/acquire", post(acquire::<S>))
        .route("/admin/pools/{pool}/release", post(release::<S>))
        .route("/admin/pools/{pool}/cleanup", post(cleanup::<S>))
        .route("/admin/pools/{pool}/release-all", post(release_all::<S>))
        .route("/admin/pools/{pool}/dedup", post(dedup::<S>))
        .with_state(state)
}

/// Account as listed by the admin API. Never carries the password.
#[derive(Debug, Serialize)]
struct AccountView {
    username: String,
    status: &'static str,
    created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    acquired_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    released_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cooldown_until: Option<f64>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            username: account.username().to_string(),
            status: account.state().label(),
            created_at: account.created_at(),
            acquired_at: account.acquired_at(),
            released_at: account.released_at(),
            cooldown_until: account.cooldown_until(),
        }
    }
}

/// A leased account as handed to the caller who acquired it.
#[derive(Debug, Serialize)]
struct LeasedAccount {
    username: String,
    password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    acquired_at: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ReleaseRequest {
    username: String,
    #[serde(default)]
    cooldown_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct CleanupRequest {
    #[serde(default)]
    timeout_secs: Option<u64>,
}

/// GET /admin/pools/{pool}: record counts after a repair and reap pass.
async fn pool_status<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
) -> Result<Json<PoolCounts>> {
    Ok(Json(state.coordinator.status(&pool).await?))
}

/// GET /admin/pools/{pool}/accounts: every account with its status.
async fn list_accounts<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let accounts = state.coordinator.list_all(&pool).await?;
    let views: Vec<AccountView> = accounts.iter().map(AccountView::from).collect();
    Ok(Json(serde_json::json!({ "accounts": views })))
}

/// PUT /admin/pools/{pool}/accounts: wipe the pool and store `[{username, password}]`.
async fn save_accounts<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
    Json(seeds): Json<Vec<AccountSeed>>,
) -> Result<Json<serde_json::Value>> {
    let saved = state.coordinator.save(&pool, &seeds).await?;
    Ok(Json(serde_json::json!({ "saved": saved })))
}

/// POST /admin/pools/{pool}/acquire: lease one account, 404 if none available.
async fn acquire<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
) -> Result<Response> {
    let response = match state.coordinator.acquire(&pool).await? {
        Some(account) => {
            let leased = LeasedAccount {
                username: account.username().to_string(),
                password: account.password().expose().clone(),
                acquired_at: account.acquired_at(),
            };
            (
                StatusCode::OK,
                Json(serde_json::json!({ "account": leased })),
            )
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no account available" })),
        )
            .into_response(),
    };
    Ok(response)
}

/// POST /admin/pools/{pool}/release: `{username, cooldown_secs?}`.
async fn release<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
    Json(body): Json<ReleaseRequest>,
) -> Result<Json<serde_json::Value>> {
    if body.username.trim().is_empty() {
        return Err(Error::BadRequest("username must not be empty".into()));
    }
    let released = state
        .coordinator
        .release_username(&pool, &body.username, body.cooldown_secs)
        .await?;
    Ok(Json(serde_json::json!({ "released": released })))
}

/// POST /admin/pools/{pool}/cleanup: `{timeout_secs?}`, defaulting to the configured lease timeout.
async fn cleanup<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
    Json(body): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>> {
    let timeout = body
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(state.lease_timeout);
    let cleaned = state.coordinator.cleanup_expired(&pool, timeout).await?;
    Ok(Json(serde_json::json!({ "cleaned": cleaned })))
}

/// POST /admin/pools/{pool}/release-all: return every leased account without cooldown.
async fn release_all<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let released = state.coordinator.release_all(&pool).await?;
    Ok(Json(serde_json::json!({ "released": released })))
}

/// POST /admin/pools/{pool}/dedup: force a rebuild and report what it removed.
async fn dedup<S: Store>(
    State(state): State<AdminState<S>>,
    Path(pool): Path<String>,
) -> Result<Json<DedupReport>> {
    Ok(Json(state.coordinator.remove_duplicates(&pool).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use lease_pool::{ManualClock, MemoryStore};
    use tower::ServiceExt;

    const POOL: &str = "account_pool_v3";

    fn test_state() -> (AdminState<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let coordinator = LeaseCoordinator::new(MemoryStore::new()).with_clock(clock.clone());
        (
            AdminState::new(Arc::new(coordinator), Duration::from_secs(3600)),
            clock,
        )
    }

    async fn seeded_state(names: &[&str]) -> (AdminState<MemoryStore>, Arc<ManualClock>) {
        let (state, clock) = test_state();
        let seeds: Vec<AccountSeed> = names.iter().map(|n| AccountSeed::new(*n, "pw")).collect();
        state.coordinator.save(POOL, &seeds).await.unwrap();
        (state, clock)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(
        state: &AdminState<MemoryStore>,
        request: Request<Body>,
    ) -> (StatusCode, serde_json::Value) {
        let response = build_admin_router(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn status_of_empty_pool() {
        let (state, _) = test_state();
        let (status, json) = send(&state, empty_request("GET", "/admin/pools/empty")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({"available": 0, "in_use": 0, "cooldown": 0, "total": 0})
        );
    }

    #[tokio::test]
    async fn save_then_list_hides_passwords() {
        let (state, _) = test_state();
        let (status, json) = send(
            &state,
            json_request(
                "PUT",
                "/admin/pools/account_pool_v3/accounts",
                serde_json::json!([
                    {"username": "a", "password": "secret-a"},
                    {"username": "a", "password": "secret-dup"},
                    {"username": "b"}
                ]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["saved"], true);

        let (status, json) = send(
            &state,
            empty_request("GET", "/admin/pools/account_pool_v3/accounts"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["username"], "a");
        assert_eq!(accounts[0]["status"], "available");
        assert!(accounts[0].get("password").is_none());
        assert!(!json.to_string().contains("secret-a"));
    }

    #[tokio::test]
    async fn save_drops_rows_with_null_fields() {
        let (state, _) = test_state();
        let (status, json) = send(
            &state,
            json_request(
                "PUT",
                "/admin/pools/account_pool_v3/accounts",
                serde_json::json!([
                    {"username": "good", "password": "pw"},
                    {"username": "bad", "password": null},
                    {"username": null, "password": "pw"}
                ]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["saved"], true);

        let (_, json) = send(&state, empty_request("GET", "/admin/pools/account_pool_v3")).await;
        assert_eq!(json["available"], 1);
        assert_eq!(json["total"], 1);
    }

    #[tokio::test]
    async fn acquire_returns_credentials_then_404() {
        let (state, _) = seeded_state(&["a"]).await;

        let (status, json) = send(
            &state,
            empty_request("POST", "/admin/pools/account_pool_v3/acquire"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["account"]["username"], "a");
        assert_eq!(json["account"]["password"], "pw");
        assert_eq!(json["account"]["acquired_at"], 1_000.0);

        let (status, json) = send(
            &state,
            empty_request("POST", "/admin/pools/account_pool_v3/acquire"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "no account available");
    }

    #[tokio::test]
    async fn release_round_trip_and_double_release() {
        let (state, _) = seeded_state(&["a"]).await;
        state.coordinator.acquire(POOL).await.unwrap().unwrap();

        let release = || {
            json_request(
                "POST",
                "/admin/pools/account_pool_v3/release",
                serde_json::json!({"username": "a", "cooldown_secs": 30}),
            )
        };
        let (status, json) = send(&state, release()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["released"], true);

        let (_, json) = send(&state, release()).await;
        assert_eq!(json["released"], false);

        let counts = state.coordinator.status(POOL).await.unwrap();
        assert_eq!(counts.cooldown, 1);
    }

    #[tokio::test]
    async fn release_without_username_is_bad_request() {
        let (state, _) = seeded_state(&["a"]).await;
        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/admin/pools/account_pool_v3/release",
                serde_json::json!({"username": " "}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("username"));
    }

    #[tokio::test]
    async fn cleanup_uses_configured_timeout_by_default() {
        let (state, clock) = seeded_state(&["a", "b"]).await;
        state.coordinator.acquire(POOL).await.unwrap().unwrap();
        clock.advance(60.0);

        let (status, json) = send(
            &state,
            json_request(
                "POST",
                "/admin/pools/account_pool_v3/cleanup",
                serde_json::json!({}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cleaned"], 0);

        let (_, json) = send(
            &state,
            json_request(
                "POST",
                "/admin/pools/account_pool_v3/cleanup",
                serde_json::json!({"timeout_secs": 0}),
            ),
        )
        .await;
        assert_eq!(json["cleaned"], 1);
    }

    #[tokio::test]
    async fn release_all_and_dedup() {
        let (state, _) = seeded_state(&["a", "b", "c"]).await;
        state.coordinator.acquire(POOL).await.unwrap().unwrap();
        state.coordinator.acquire(POOL).await.unwrap().unwrap();

        let (status, json) = send(
            &state,
            empty_request("POST", "/admin/pools/account_pool_v3/release-all"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["released"], 2);

        let (status, json) = send(
            &state,
            empty_request("POST", "/admin/pools/account_pool_v3/dedup"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json,
            serde_json::json!({"removed": 0, "available": 3, "in_use": 0, "cooldown": 0})
        );
    }

    #[tokio::test]
    async fn store_type_error_maps_to_500() {
        let (state, _) = test_state();
        // A set where the available list belongs makes every read fail.
        state
            .coordinator
            .store()
            .commit(lease_pool::store::Patch::new().sadd("broken", vec!["x".into()]))
            .await
            .unwrap();

        let (status, json) = send(&state, empty_request("GET", "/admin/pools/broken")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"].as_str().unwrap().contains("WRONGTYPE"));
    }
}
