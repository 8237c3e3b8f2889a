//! Transport envelope
//!
//! Payloads are opaque bytes. The envelope carries the routing metadata every
//! backend needs: tenant (as signed msb/lsb halves), optional entity, an
//! optional explicit partition and free-form string headers.

use crate::queue::error::{QueueError, QueueResult};
use crate::queue::key::{EntityId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header naming the service a notification is addressed to
pub const TARGET_SERVICE_HEADER: &str = "target";
/// Header carrying the envelope format version
pub const VERSION_HEADER: &str = "envelope_version";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub correlation_id: Uuid,
    pub tenant_id_msb: i64,
    pub tenant_id_lsb: i64,
    pub entity_id: Option<Uuid>,
    #[serde(with = "payload_encoding")]
    pub payload: Vec<u8>,
    pub partition_hint: Option<u32>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    pub fn new(tenant_id: TenantId, entity_id: Option<EntityId>, payload: Vec<u8>) -> Self {
        let (tenant_id_msb, tenant_id_lsb) = tenant_id.msb_lsb();
        let mut headers = BTreeMap::new();
        headers.insert(
            VERSION_HEADER.to_string(),
            crate::core::version::envelope_version().to_string(),
        );
        Self {
            correlation_id: Uuid::new_v4(),
            tenant_id_msb,
            tenant_id_lsb,
            entity_id: entity_id.map(|e| e.0),
            payload,
            partition_hint: None,
            headers,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId::from_msb_lsb(self.tenant_id_msb, self.tenant_id_lsb)
    }

    pub fn entity_id(&self) -> Option<EntityId> {
        self.entity_id.map(EntityId)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_partition_hint(mut self, partition: u32) -> Self {
        self.partition_hint = Some(partition);
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Serialise for a wire backend
    pub fn encode(&self) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Codec {
            message: e.to_string(),
        })
    }

    /// Parse bytes produced by [`encode`](Self::encode)
    ///
    /// Envelopes from a newer format version are rejected.
    pub fn decode(bytes: &[u8]) -> QueueResult<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes).map_err(|e| QueueError::Codec {
            message: e.to_string(),
        })?;

        let current = crate::core::version::envelope_version();
        if let Some(version) = envelope.header(VERSION_HEADER) {
            match version.parse::<u32>() {
                Ok(v) if v <= current => {}
                _ => {
                    return Err(QueueError::Codec {
                        message: format!(
                            "unsupported envelope version '{}' (supported up to {})",
                            version, current
                        ),
                    })
                }
            }
        }
        Ok(envelope)
    }
}

/// Result of a completed send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendMetadata {
    pub topic: String,
    pub offset: u64,
}

// Payload bytes as a JSON array of numbers is bulky; use hex instead
mod payload_encoding {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        serializer.serialize_str(&out)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd-length payload"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&hex[i..i + 2], 16).map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
