//! Remote document store client.
//!
//! The forwarder and the config subscriber depend on the [`DocumentStore`]
//! trait; [`HttpDocumentStore`] satisfies it over the store's REST surface.
//! Errors are pre-classified so the forwarder's retry policy is a plain
//! match.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::TokenSource;
use crate::error::Result as GatewayResult;

/// Reconnect delay for the snapshot stream.
const WATCH_RECONNECT: Duration = Duration::from_secs(5);

/// Store path of a location's configuration document.
#[must_use]
pub fn location_document_path(company_id: &str, location: &str) -> String {
    format!("companies/{company_id}/locations/{location}")
}

/// A remote write/read failure, classified for retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Credential missing, expired, or refused (401/403).
    #[error("store authentication rejected")]
    Auth,

    /// Worth retrying: network failure or 5xx.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Not worth retrying: the store rejected the payload (other 4xx).
    #[error("permanent store error: status {status}")]
    Permanent { status: u16 },
}

/// The remote document store interface.
///
/// Every pipeline write is a merge-update at a deterministic id, so plain
/// creation never comes up.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Update a document; with `merge`, absent fields are left alone and
    /// the document is created if missing.
    async fn update(&self, path: &str, patch: &Value, merge: bool) -> Result<(), StoreError>;

    /// Fetch a document. `Ok(None)` when it does not exist.
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Snapshot stream on a document: emits the current content, then
    /// again whenever it changes. Errors reconnect internally; the channel
    /// closes only on cancellation.
    fn watch(&self, path: &str, cancel: CancellationToken) -> mpsc::Receiver<Value>;
}

/// REST client for the remote document store.
#[derive(Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    watch_interval: Duration,
}

impl HttpDocumentStore {
    /// Build a client over the store's base URL.
    pub fn new(
        base_url: &str,
        tokens: Arc<dyn TokenSource>,
        request_timeout: Duration,
        watch_interval: Duration,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            tokens,
            watch_interval,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn bearer(&self) -> Result<String, StoreError> {
        self.tokens.current_token().ok_or(StoreError::Auth)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        classify(response.status())?;
        Ok(response)
    }
}

/// Map a response status onto the retry taxonomy.
fn classify(status: reqwest::StatusCode) -> Result<(), StoreError> {
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 | 403 => Err(StoreError::Auth),
        code if status.is_client_error() => Err(StoreError::Permanent { status: code }),
        code => Err(StoreError::Transient(format!("status {code}"))),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn update(&self, path: &str, patch: &Value, merge: bool) -> Result<(), StoreError> {
        let token = self.bearer()?;
        let request = self
            .client
            .patch(self.url(path))
            .query(&[("merge", merge)])
            .bearer_auth(token)
            .json(patch);
        self.send(request).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let token = self.bearer()?;
        let response = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        classify(response.status())?;

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| StoreError::Transient(e.to_string()))
    }

    fn watch(&self, path: &str, cancel: CancellationToken) -> mpsc::Receiver<Value> {
        let (tx, rx) = mpsc::channel(8);
        let store = self.clone();
        let path = path.to_owned();

        tokio::spawn(async move {
            let mut last: Option<Value> = None;

            loop {
                if cancel.is_cancelled() {
                    return;
                }

                let delay = match store.get(&path).await {
                    Ok(Some(value)) => {
                        if last.as_ref() != Some(&value) {
                            last = Some(value.clone());
                            if tx.send(value).await.is_err() {
                                return;
                            }
                        }
                        store.watch_interval
                    }
                    Ok(None) => {
                        debug!(path, "watched document absent");
                        store.watch_interval
                    }
                    Err(e) => {
                        warn!(path, error = %e, "snapshot stream error, reconnecting");
                        WATCH_RECONNECT
                    }
                };

                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        });

        rx
    }
}

impl std::fmt::Debug for HttpDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpDocumentStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(classify(reqwest::StatusCode::OK).is_ok());
        assert!(classify(reqwest::StatusCode::CREATED).is_ok());
        assert_eq!(
            classify(reqwest::StatusCode::UNAUTHORIZED),
            Err(StoreError::Auth)
        );
        assert_eq!(
            classify(reqwest::StatusCode::FORBIDDEN),
            Err(StoreError::Auth)
        );
        assert_eq!(
            classify(reqwest::StatusCode::UNPROCESSABLE_ENTITY),
            Err(StoreError::Permanent { status: 422 })
        );
        assert!(matches!(
            classify(reqwest::StatusCode::SERVICE_UNAVAILABLE),
            Err(StoreError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn missing_token_is_an_auth_error() {
        struct NoToken;
        impl TokenSource for NoToken {
            fn current_token(&self) -> Option<String> {
                None
            }
        }

        let store = HttpDocumentStore::new(
            "http://127.0.0.1:9",
            Arc::new(NoToken),
            Duration::from_secs(1),
            Duration::from_secs(30),
        )
        .unwrap();

        let err = store
            .update("tagReads/x", &serde_json::json!({}), true)
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Auth);
    }
}
