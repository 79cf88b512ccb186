//! Gateway half of the tagflow pipeline.
//!
//! Authenticates against the remote document store, keeps a live snapshot
//! of the location configuration, drains the staging queue with retries,
//! and exposes a small control API.

pub mod api;
pub mod auth;
pub mod config_sub;
pub mod error;
pub mod forwarder;
pub mod store;

pub use auth::{AuthManager, TokenSource};
pub use config_sub::ConfigSubscriber;
pub use error::{GatewayError, Result};
pub use forwarder::Forwarder;
pub use store::{DocumentStore, HttpDocumentStore, StoreError};
