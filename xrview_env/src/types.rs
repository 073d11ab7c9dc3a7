//! Common types for the XRView environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier for one live subscription (topic or transform frame).
///
/// Uses UUID v4 so independent transports never hand out colliding ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random SubscriptionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SubscriptionId from a counter (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Wire compression requested from the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Cbor,
    Png,
}

/// Transport options passed with every subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Payload encoding on the wire
    pub compression: Compression,

    /// Minimum spacing between deliveries in milliseconds (0 = unthrottled)
    pub throttle_rate_ms: u32,

    /// Outgoing queue depth on the bridge; 1 means only the newest message
    /// is ever delivered and older ones are dropped, 0 means unbounded
    pub queue_size: u32,
}

impl SubscribeOptions {
    /// Options used for heavy sensor streams (point clouds).
    pub fn sensor_stream() -> Self {
        Self {
            compression: Compression::Cbor,
            throttle_rate_ms: 100,
            queue_size: 1,
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            throttle_rate_ms: 0,
            queue_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_ids_are_stable() {
        assert_eq!(SubscriptionId::from_seed(7), SubscriptionId::from_seed(7));
        assert_ne!(SubscriptionId::from_seed(7), SubscriptionId::from_seed(8));
    }

    #[test]
    fn test_sensor_stream_options() {
        let opts = SubscribeOptions::sensor_stream();
        assert_eq!(opts.compression, Compression::Cbor);
        assert_eq!(opts.throttle_rate_ms, 100);
        assert_eq!(opts.queue_size, 1);
    }

    #[test]
    fn test_default_options_are_unbounded() {
        let opts = SubscribeOptions::default();
        assert_eq!(opts.compression, Compression::None);
        assert_eq!(opts.throttle_rate_ms, 0);
        assert_eq!(opts.queue_size, 0);
    }
}
