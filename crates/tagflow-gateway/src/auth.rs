//! Credential management for the remote document store.
//!
//! A one-time invitation code is exchanged for a short-lived credential
//! (nominal lifetime 60 minutes) which is refreshed every 45. Token state
//! persists on disk; a restart inside the reuse window picks it up with a
//! refresh instead of burning a new invitation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tagflow_core::config::AuthConfig;

use crate::error::{GatewayError, Result};

/// Read-only view of the current credential.
///
/// The store client depends on this seam, not on [`AuthManager`], so tests
/// can substitute a fixed token.
pub trait TokenSource: Send + Sync {
    /// The bearer token to present, if any.
    fn current_token(&self) -> Option<String>;
}

/// Persisted token state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenState {
    pub token: String,
    pub location: String,
    pub company: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvitationResponse {
    success: bool,
    custom_token: Option<String>,
    location_name: Option<String>,
    company_id: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    success: bool,
    custom_token: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// Exchanges, refreshes, and persists the store credential.
pub struct AuthManager {
    client: reqwest::Client,
    functions_url: String,
    state_path: PathBuf,
    reuse_window: chrono::Duration,
    state: RwLock<Option<TokenState>>,
    healthy: AtomicBool,
}

impl AuthManager {
    /// Build a manager with no credential yet. No network traffic.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            functions_url: config.functions_url.trim_end_matches('/').to_owned(),
            state_path: config.state_path.clone(),
            reuse_window: chrono::Duration::seconds(config.reuse_window_secs as i64),
            state: RwLock::new(None),
            healthy: AtomicBool::new(false),
        })
    }

    /// Acquire a working credential at startup.
    ///
    /// Persisted state younger than the reuse window is tried first via a
    /// refresh; failing that the invitation code is exchanged. No code and
    /// no reusable state is a startup failure.
    pub async fn bootstrap(&self, invitation_code: Option<&str>) -> Result<()> {
        if let Some(persisted) = self.load_persisted() {
            let age = Utc::now() - persisted.acquired_at;
            if age < self.reuse_window {
                info!(
                    location = %persisted.location,
                    age_hours = age.num_hours(),
                    "reusing persisted credential"
                );
                self.set_state(persisted);
                match self.refresh().await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(error = %e, "persisted credential refused, clearing");
                        self.clear_state();
                    }
                }
            } else {
                debug!("persisted credential too old, discarding");
                self.clear_state();
            }
        }

        let Some(code) = invitation_code else {
            return Err(GatewayError::Auth(
                "no reusable credential and no invitation code".to_owned(),
            ));
        };
        self.validate_invitation(code).await
    }

    /// Exchange the one-time invitation code.
    async fn validate_invitation(&self, code: &str) -> Result<()> {
        let url = format!("{}/validateInvitation", self.functions_url);
        let response: InvitationResponse = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "invitationCode": code }))
            .send()
            .await?
            .json()
            .await?;

        if !response.success {
            return Err(GatewayError::Auth("invitation rejected".to_owned()));
        }

        let (Some(token), Some(location), Some(company)) = (
            response.custom_token,
            response.location_name,
            response.company_id,
        ) else {
            return Err(GatewayError::Auth(
                "invitation response missing fields".to_owned(),
            ));
        };

        info!(location = %location, company = %company, "invitation accepted");
        self.set_state(TokenState {
            token,
            location,
            company,
            acquired_at: Utc::now(),
        });
        Ok(())
    }

    /// Refresh the current credential. Failure marks the manager unhealthy
    /// and surfaces to the forwarder as auth errors on its next write.
    pub async fn refresh(&self) -> Result<()> {
        let Some(current) = self.read_state() else {
            self.healthy.store(false, Ordering::Release);
            return Err(GatewayError::Unauthenticated);
        };

        let url = format!("{}/refreshToken", self.functions_url);
        let result: Result<RefreshResponse> = async {
            Ok(self
                .client
                .post(&url)
                .bearer_auth(&current.token)
                .send()
                .await?
                .json()
                .await?)
        }
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.healthy.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let token = match (response.success, response.custom_token) {
            (true, Some(token)) => token,
            _ => {
                self.healthy.store(false, Ordering::Release);
                return Err(GatewayError::Auth("refresh refused".to_owned()));
            }
        };

        debug!("credential refreshed");
        self.set_state(TokenState {
            token,
            acquired_at: Utc::now(),
            ..current
        });
        Ok(())
    }

    /// Refresh on a fixed cadence until cancelled.
    pub async fn run_refresh_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.refresh().await {
                // Keep running; the operator restarts with a new invitation
                // if this never recovers.
                error!(error = %e, "scheduled credential refresh failed");
            }
        }
    }

    /// Whether the last auth interaction succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Location name from the credential exchange, if authenticated.
    #[must_use]
    pub fn location(&self) -> Option<String> {
        self.read_state().map(|s| s.location)
    }

    /// Company id from the credential exchange, if authenticated.
    #[must_use]
    pub fn company(&self) -> Option<String> {
        self.read_state().map(|s| s.company)
    }

    fn read_state(&self) -> Option<TokenState> {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_state(&self, state: TokenState) {
        self.persist(&state);
        match self.state.write() {
            Ok(mut guard) => *guard = Some(state),
            Err(poisoned) => *poisoned.into_inner() = Some(state),
        }
        self.healthy.store(true, Ordering::Release);
    }

    fn clear_state(&self) {
        match self.state.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.healthy.store(false, Ordering::Release);
        if self.state_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.state_path) {
                warn!(error = %e, "could not remove persisted credential");
            }
        }
    }

    fn load_persisted(&self) -> Option<TokenState> {
        let raw = std::fs::read_to_string(&self.state_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "persisted credential unreadable, ignoring");
                None
            }
        }
    }

    fn persist(&self, state: &TokenState) {
        let json = match serde_json::to_string_pretty(state) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "credential serialisation failed");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.state_path, json) {
            warn!(error = %e, path = %self.state_path.display(), "credential persist failed");
        }
    }
}

impl TokenSource for AuthManager {
    fn current_token(&self) -> Option<String> {
        self.read_state().map(|s| s.token)
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager")
            .field("functions_url", &self.functions_url)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &tempfile::TempDir) -> AuthConfig {
        AuthConfig {
            functions_url: "http://127.0.0.1:9".to_owned(),
            invitation_code: None,
            state_path: dir.path().join("auth-state.json"),
            ..AuthConfig::default()
        }
    }

    fn state(age_days: i64) -> TokenState {
        TokenState {
            token: "tok".to_owned(),
            location: "warehouse-7".to_owned(),
            company: "acme".to_owned(),
            acquired_at: Utc::now() - chrono::Duration::days(age_days),
        }
    }

    #[tokio::test]
    async fn persists_and_reloads_state() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();

        auth.set_state(state(0));
        assert_eq!(auth.current_token().as_deref(), Some("tok"));
        assert!(auth.is_healthy());

        // A second manager sees the persisted state.
        let again = AuthManager::new(&config(&dir)).unwrap();
        let loaded = again.load_persisted().unwrap();
        assert_eq!(loaded.location, "warehouse-7");
    }

    #[tokio::test]
    async fn stale_state_is_discarded_at_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();
        auth.persist(&state(8));

        // Too old to reuse, and no invitation code: startup failure.
        let err = auth.bootstrap(None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
        assert!(!auth.is_healthy());
    }

    #[tokio::test]
    async fn bootstrap_without_anything_fails() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();
        assert!(auth.bootstrap(None).await.is_err());
    }

    #[tokio::test]
    async fn refresh_without_state_is_unauthenticated() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();
        let err = auth.refresh().await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn failed_refresh_marks_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();
        auth.set_state(state(0));
        assert!(auth.is_healthy());

        // Nothing listens on the functions URL.
        assert!(auth.refresh().await.is_err());
        assert!(!auth.is_healthy());
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let auth = AuthManager::new(&config(&dir)).unwrap();
        auth.set_state(state(0));
        assert!(config(&dir).state_path.exists());

        auth.clear_state();
        assert!(!config(&dir).state_path.exists());
        assert!(auth.current_token().is_none());
    }
}
