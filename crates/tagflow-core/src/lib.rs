//! Shared foundation for the tagflow pipeline.
//!
//! The ingestor and gateway binaries both build on this crate:
//!
//! - **Data model**: broker message classification, normalised tag events,
//!   and the tag documents written downstream ([`event`])
//! - **Group resolution**: reader hostname to deduplication group ([`groups`])
//! - **Configuration**: layered TOML + environment configuration and the
//!   live location-config snapshot type ([`config`])
//! - **Logging**: tracing initialisation honouring the deployment's
//!   environment switches ([`logging`])

pub mod config;
pub mod error;
pub mod event;
pub mod groups;
pub mod logging;

pub use config::{AppConfig, LocationConfig};
pub use error::{CoreError, Result};
pub use event::{
    BrokerMessage, GenericEvent, ProcessContext, TagDocument, TagEvent, PLACEHOLDER_HOSTNAME,
};
pub use groups::GroupMap;
