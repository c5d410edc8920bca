//! The request packet: what a viewer receives for every completed request.
//!
//! A [`RequestPacket`] is a self-contained snapshot built from a completed
//! [`InterceptionRecord`] and the [`Environment`] the relay runs in.  It owns
//! copies of everything it needs and holds no reference back to the record.
//!
//! # JSON shape
//!
//! ```text
//! {
//!   "packetId": "…uuid…",
//!   "url": "https://example.com/a",
//!   "requestMethod": "GET",
//!   "requestHeaders": { "Accept": "*/*" },
//!   "requestBody": "",                      // base64
//!   "requestTruncated": true,               // only when the body hit the cap
//!   "responseHeaders": { … },               // absent on some error records
//!   "responseData": "eyJhIjoxfQ==",         // base64
//!   "statusCode": "200",
//!   "startDate": 1700000000000000,          // µs since Unix epoch
//!   "endDate": 1700000000250000,
//!   "error": "connection reset",            // error records only
//!   "responseTruncated": true,              // only when the body hit the cap
//!   "projectDescriptor": { "projectName": "demo" },
//!   "deviceDescriptor": { "deviceId": "…", "deviceName": "…", "deviceDescription": "…" },
//!   "protocolVersion": "0.1.0",
//!   "originatingAddress": "192.168.1.20:51532"
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::domain::record::{HeaderMap, InterceptionRecord};
use crate::protocol::codec::CodecError;

/// Identifies the device the relay runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub device_description: String,
}

/// Identifies the application the relay is embedded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub project_name: String,
}

/// Metadata stamped into every packet produced by one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Environment {
    pub project: ProjectDescriptor,
    pub device: DeviceDescriptor,
    pub protocol_version: String,
    pub originating_address: String,
}

/// Serialization-ready snapshot of one completed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPacket {
    pub packet_id: String,
    pub url: String,
    pub request_method: String,
    pub request_headers: HeaderMap,
    #[serde(with = "base64_bytes")]
    pub request_body: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub request_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HeaderMap>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_opt_bytes")]
    pub response_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    pub start_date: u64,
    pub end_date: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub response_truncated: bool,
    pub project_descriptor: ProjectDescriptor,
    pub device_descriptor: DeviceDescriptor,
    pub protocol_version: String,
    pub originating_address: String,
}

impl RequestPacket {
    /// Builds a packet from a completed record.
    ///
    /// # Errors
    ///
    /// - [`CodecError::NotCompleted`] if the record has not reached a terminal
    ///   state.
    /// - [`CodecError::MissingResponse`] if the record completed successfully
    ///   but never received response metadata.
    pub fn from_record(record: &InterceptionRecord, env: &Environment) -> Result<Self, CodecError> {
        let end_date = match (record.is_completed(), record.end_time_us()) {
            (true, Some(end)) => end,
            _ => return Err(CodecError::NotCompleted(record.id())),
        };
        if record.error().is_none() && !record.has_response() {
            return Err(CodecError::MissingResponse(record.id()));
        }

        let response_data = if record.has_response() || !record.response_body().is_empty() {
            Some(record.response_body().to_vec())
        } else {
            None
        };

        Ok(Self {
            packet_id: record.id().to_string(),
            url: record.request_url().to_string(),
            request_method: record.request_method().to_string(),
            request_headers: record.request_headers().clone(),
            request_body: record.request_body().to_vec(),
            request_truncated: record.request_truncated(),
            response_headers: record.response_headers().cloned(),
            response_data,
            status_code: record.status_code().map(str::to_string),
            start_date: record.start_time_us(),
            end_date,
            error: record.error().map(str::to_string),
            response_truncated: record.body_truncated(),
            project_descriptor: env.project.clone(),
            device_descriptor: env.device.clone(),
            protocol_version: env.protocol_version.clone(),
            originating_address: env.originating_address.clone(),
        })
    }

    /// `true` for packets describing a failed request.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Checks the invariants serde cannot express.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.packet_id.is_empty() {
            return Err("packetId is empty".to_string());
        }
        if self.url.is_empty() {
            return Err("url is empty".to_string());
        }
        if self.request_method.is_empty() {
            return Err("requestMethod is empty".to_string());
        }
        if self.end_date < self.start_date {
            return Err(format!(
                "endDate {} precedes startDate {}",
                self.end_date, self.start_date
            ));
        }
        if self.error.is_none() {
            if self.status_code.is_none() {
                return Err("success packet without statusCode".to_string());
            }
            if self.response_headers.is_none() {
                return Err("success packet without responseHeaders".to_string());
            }
            if self.response_data.is_none() {
                return Err("success packet without responseData".to_string());
            }
        }
        Ok(())
    }
}

/// Room a packet needs besides its two bodies: URL, headers, descriptors and
/// JSON syntax.
pub const PACKET_ENVELOPE_ALLOWANCE: usize = 1024 * 1024;

/// Smallest frame limit that carries a packet whose request and response
/// bodies both sit at `max_body_bytes`.  Bodies travel as base64, which turns
/// every 3 bytes into 4.
pub const fn frame_len_for_body_cap(max_body_bytes: usize) -> usize {
    let groups = max_body_bytes / 3 + if max_body_bytes % 3 == 0 { 0 } else { 1 };
    groups
        .saturating_mul(4)
        .saturating_mul(2)
        .saturating_add(PACKET_ENVELOPE_ALLOWANCE)
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ── Base64 body helpers ───────────────────────────────────────────────────────

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod base64_opt_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => {
                serializer.serialize_some(&base64::engine::general_purpose::STANDARD.encode(bytes))
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| {
                base64::engine::general_purpose::STANDARD
                    .decode(s.as_bytes())
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
