//! Broker message classification and the tag data model.
//!
//! Readers publish text-encoded records with an `event_type` discriminator.
//! `tagInventory` messages carry a nested tag read and are normalised into
//! [`TagEvent`]; every other type follows the generic path and is wrapped
//! into a [`GenericEvent`] verbatim.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Substituted when a tag inventory arrives without an outer hostname.
///
/// Readers running firmware older than v8 omit the field; the literal is
/// carried through to the document so the fleet can be audited for them.
pub const PLACEHOLDER_HOSTNAME: &str = "NoHostUpgradeToVersion8";

/// Discriminator value for tag inventory messages.
pub const TAG_INVENTORY: &str = "tagInventory";

/// A classified broker message.
#[derive(Debug, Clone)]
pub enum BrokerMessage {
    /// A normalised tag observation.
    TagInventory(TagEvent),
    /// Any other event type, wrapped verbatim.
    Generic(GenericEvent),
}

/// A single normalised tag observation from a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct TagEvent {
    /// Tag id, uppercase hex.
    pub tid: String,
    /// Electronic product code; defaults to the tid when absent.
    pub epc: String,
    /// Reader hostname, or [`PLACEHOLDER_HOSTNAME`].
    pub hostname: String,
    /// Antenna port, 1-based.
    pub antenna: u16,
    /// Peak RSSI in centi-dBm.
    pub rssi_cdbm: Option<i32>,
    /// Timestamp assigned by the reader.
    pub host_timestamp: DateTime<Utc>,
    /// Optional position fix.
    pub lat: Option<f64>,
    /// Optional position fix.
    pub lon: Option<f64>,
    /// Broker topic the message arrived on.
    pub topic: String,
}

/// Wire shape of a `tagInventory` message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TagInventoryMessage {
    hostname: Option<String>,
    tag_inventory_event: RawTagRead,
}

/// Nested tag record inside a `tagInventory` message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTagRead {
    tid: Option<String>,
    epc: Option<String>,
    antenna_port: Option<u16>,
    peak_rssi_cdbm: Option<i32>,
    host_timestamp: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
}

/// A non-tag event wrapped for downstream storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericEvent {
    /// Original discriminator, if the message carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Outer hostname, or [`PLACEHOLDER_HOSTNAME`].
    pub hostname: String,
    /// The original payload, untouched.
    pub payload: Value,
    /// Time the pipeline observed the message.
    pub server_timestamp: DateTime<Utc>,
    /// Generic events are staged unread.
    pub read: bool,
}

/// Classify and normalise a broker payload.
///
/// Returns [`CoreError::Malformed`] when the payload is not valid JSON and
/// [`CoreError::MissingTid`] when a tag inventory has no tag id. Messages
/// without an `event_type`, and every non-`tagInventory` type, take the
/// generic path.
pub fn parse_message(
    topic: &str,
    payload: &[u8],
    now: DateTime<Utc>,
) -> Result<BrokerMessage, CoreError> {
    let value: Value = serde_json::from_slice(payload)?;
    let event_type = value.get("event_type").and_then(Value::as_str);

    if event_type == Some(TAG_INVENTORY) {
        let msg: TagInventoryMessage = serde_json::from_value(value)?;
        return normalise_tag_inventory(msg, topic, now).map(BrokerMessage::TagInventory);
    }

    let hostname = value
        .get("hostname")
        .and_then(Value::as_str)
        .unwrap_or(PLACEHOLDER_HOSTNAME)
        .to_owned();

    Ok(BrokerMessage::Generic(GenericEvent {
        event_type: event_type.map(str::to_owned),
        hostname,
        payload: value,
        server_timestamp: now,
        read: false,
    }))
}

fn normalise_tag_inventory(
    msg: TagInventoryMessage,
    topic: &str,
    now: DateTime<Utc>,
) -> Result<TagEvent, CoreError> {
    let raw = msg.tag_inventory_event;
    let tid = raw
        .tid
        .filter(|t| !t.is_empty())
        .ok_or(CoreError::MissingTid)?
        .to_uppercase();

    let epc = raw
        .epc
        .filter(|e| !e.is_empty())
        .map_or_else(|| tid.clone(), |e| e.to_uppercase());

    Ok(TagEvent {
        tid,
        epc,
        hostname: msg
            .hostname
            .unwrap_or_else(|| PLACEHOLDER_HOSTNAME.to_owned()),
        antenna: raw.antenna_port.filter(|p| *p >= 1).unwrap_or(1),
        rssi_cdbm: raw.peak_rssi_cdbm,
        host_timestamp: raw.host_timestamp.unwrap_or(now),
        lat: raw.lat,
        lon: raw.lon,
        topic: topic.to_owned(),
    })
}

/// The document written to the remote store for each forwarded tag read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagDocument {
    pub tid: String,
    pub epc: String,
    pub hostname: String,
    pub antenna_port: u16,
    /// Decimal rendering of the antenna port, kept for display queries.
    pub antenna_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_cdbm: Option<i32>,
    pub host_timestamp: DateTime<Utc>,
    pub server_timestamp: DateTime<Utc>,
    pub location: String,
    pub company_id: String,
    pub frequency_hz: u64,
    pub tx_power_cdbm: i32,
    pub mobile: bool,
    /// Expiry instant: `server_timestamp` plus the configured retention.
    pub ttl: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
    pub topic: String,
}

impl TagDocument {
    /// Deterministic identity for idempotent writes:
    /// `(company_id, tid, host_timestamp, hostname)`.
    ///
    /// Repeated deliveries of the same observation land on the same id, so
    /// at-least-once forwarding merges instead of duplicating.
    pub fn document_id(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            sanitise(&self.company_id),
            sanitise(&self.tid),
            self.host_timestamp.timestamp_millis(),
            sanitise(&self.hostname),
        )
    }
}

/// Replace path-significant characters so the id stays a single segment.
fn sanitise(part: &str) -> String {
    part.replace(['/', ' '], "-")
}

/// Process-wide context attached to every tag document.
#[derive(Debug, Clone)]
pub struct ProcessContext {
    pub location: String,
    pub company_id: String,
    pub frequency_hz: u64,
    pub tx_power_cdbm: i32,
    pub mobile: bool,
    /// Document retention; default 30 days.
    pub retention: Duration,
}

impl ProcessContext {
    /// Build the outbound document for a normalised tag event.
    pub fn build_tag_document(&self, event: &TagEvent, now: DateTime<Utc>) -> TagDocument {
        TagDocument {
            tid: event.tid.clone(),
            epc: event.epc.clone(),
            hostname: event.hostname.clone(),
            antenna_port: event.antenna,
            antenna_name: event.antenna.to_string(),
            rssi_cdbm: event.rssi_cdbm,
            host_timestamp: event.host_timestamp,
            server_timestamp: now,
            location: self.location.clone(),
            company_id: self.company_id.clone(),
            frequency_hz: self.frequency_hz,
            tx_power_cdbm: self.tx_power_cdbm,
            mobile: self.mobile,
            ttl: now + self.retention,
            lat: event.lat,
            lon: event.lon,
            topic: event.topic.clone(),
        }
    }
}
