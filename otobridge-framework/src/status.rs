//! Bridge info document.
//!
//! A retained JSON document describing the running bridge, published next to
//! the plain `online`/`offline` status topic for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::availability::BridgeStatus;
use crate::publisher::{Publisher, Transport};

/// Bridge diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    /// Bridge name.
    pub bridge: String,
    /// Bridge version.
    pub version: String,
    /// Current status.
    pub status: BridgeStatus,
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Additional metadata (devices, counters).
    #[serde(flatten)]
    pub metadata: serde_json::Value,
}

impl BridgeInfo {
    /// Create an info document with empty metadata.
    pub fn new(
        bridge: impl Into<String>,
        version: impl Into<String>,
        status: BridgeStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            version: version.into(),
            status,
            started_at,
            metadata: serde_json::json!({}),
        }
    }

    /// Add metadata to the document.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Publish this document, retained, to `topic`.
    pub async fn publish<T: Transport>(&self, publisher: &Publisher<T>, topic: &str) -> Result<()> {
        publisher.publish_json(topic, self, true).await
    }
}
