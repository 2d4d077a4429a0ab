// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration sample types.
//!
//! A sample is the atomic unit of discovery gossip: one entity's state at
//! one point in time. Samples travel over the registration bus and land in
//! peer registries.

use crate::core::entity::{DataTypeInformation, EntityId};

/// What a sample announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SampleKind {
    /// A publisher exists (or refreshed its state).
    RegisterPublisher = 1,
    /// A subscriber exists.
    RegisterSubscriber = 2,
    /// A service server exists.
    RegisterServer = 3,
    /// A service client exists.
    RegisterClient = 4,
    /// A publisher went away gracefully.
    UnregisterPublisher = 5,
    /// A subscriber went away gracefully.
    UnregisterSubscriber = 6,
    /// A server went away gracefully.
    UnregisterServer = 7,
    /// A client went away gracefully.
    UnregisterClient = 8,
    /// Process liveness and metadata.
    ProcessState = 9,
}

impl SampleKind {
    /// Wire value.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a wire value.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::RegisterPublisher),
            2 => Some(Self::RegisterSubscriber),
            3 => Some(Self::RegisterServer),
            4 => Some(Self::RegisterClient),
            5 => Some(Self::UnregisterPublisher),
            6 => Some(Self::UnregisterSubscriber),
            7 => Some(Self::UnregisterServer),
            8 => Some(Self::UnregisterClient),
            9 => Some(Self::ProcessState),
            _ => None,
        }
    }

    /// Whether this kind removes an entity.
    #[must_use]
    pub fn is_unregister(self) -> bool {
        matches!(
            self,
            Self::UnregisterPublisher
                | Self::UnregisterSubscriber
                | Self::UnregisterServer
                | Self::UnregisterClient
        )
    }

    /// The unregister counterpart of a register kind.
    #[must_use]
    pub fn unregister_counterpart(self) -> Option<Self> {
        match self {
            Self::RegisterPublisher => Some(Self::UnregisterPublisher),
            Self::RegisterSubscriber => Some(Self::UnregisterSubscriber),
            Self::RegisterServer => Some(Self::UnregisterServer),
            Self::RegisterClient => Some(Self::UnregisterClient),
            _ => None,
        }
    }
}

/// Entity identity carried in every sample (host name lives in the
/// process block).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleIdentifier {
    /// Unique id within the originating process.
    pub entity: EntityId,
    /// Originating process id.
    pub process_id: u32,
}

/// Transport layer announced by an endpoint, with layer-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportLayer {
    /// UDP multicast payload delivery.
    Udp {
        /// Multicast group address.
        address: String,
        /// Multicast port.
        port: u16,
    },
    /// Shared memory ring on the publisher's host.
    Shm {
        /// Slot file names, ring order.
        slot_names: Vec<String>,
    },
    /// TCP stream; the peer connects to this port.
    Tcp {
        /// Listening port (ephemeral, discovered here).
        port: u16,
    },
}

impl TransportLayer {
    /// Wire value of the layer kind.
    #[must_use]
    pub fn kind_u8(&self) -> u8 {
        match self {
            Self::Udp { .. } => 1,
            Self::Shm { .. } => 2,
            Self::Tcp { .. } => 3,
        }
    }
}

/// Versioned transport layer descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLayerDescriptor {
    /// Layer protocol version.
    pub version: u16,
    /// Layer kind and parameters.
    pub layer: TransportLayer,
}

/// Endpoint statistics carried in registration samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCounters {
    /// Data clock (messages sent).
    pub clock: u64,
    /// Last payload size in bytes.
    pub size: u64,
    /// Messages dropped (ack misses and overruns).
    pub drops: u64,
    /// Raw entity id (redundant with the identifier, kept for monitoring).
    pub id: u64,
    /// Send frequency in mHz.
    pub frequency: u64,
}

/// Topic or service description inside a sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointBlock {
    /// Topic or service name.
    pub name: String,
    /// Payload type description (opaque, compared bytewise).
    pub datatype: DataTypeInformation,
    /// Announced transport layers.
    pub layers: Vec<TransportLayerDescriptor>,
    /// Statistics.
    pub counters: EntityCounters,
}

/// Process metadata attached to every sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessMeta {
    /// Originating process id.
    pub process_id: u32,
    /// Originating host name.
    pub host_name: String,
    /// Human readable process/unit name.
    pub unit_name: String,
    /// Free-form startup parameters.
    pub parameters: String,
}

/// One entity's registration state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// What is announced.
    pub kind: SampleKind,
    /// Entity identity.
    pub identifier: SampleIdentifier,
    /// Topic/service block; `None` for [`SampleKind::ProcessState`].
    pub endpoint: Option<EndpointBlock>,
    /// Monotonic per-entity change counter.
    pub registration_clock: u64,
    /// Originating process metadata.
    pub process: ProcessMeta,
}

impl Sample {
    /// Topic or service name, if this sample carries an endpoint.
    #[must_use]
    pub fn endpoint_name(&self) -> Option<&str> {
        self.endpoint.as_ref().map(|b| b.name.as_str())
    }

    /// Build the unregister sample announcing this entity's departure.
    #[must_use]
    pub fn to_unregister(&self) -> Option<Sample> {
        let kind = self.kind.unregister_counterpart()?;
        Some(Sample {
            kind,
            identifier: self.identifier,
            endpoint: self.endpoint.clone(),
            registration_clock: self.registration_clock + 1,
            process: self.process.clone(),
        })
    }

    /// Whether sender and receiver share a host.
    #[must_use]
    pub fn is_local_to(&self, host_name: &str) -> bool {
        self.process.host_name == host_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_u8_roundtrip() {
        for v in 1..=9u8 {
            let kind = SampleKind::from_u8(v).expect("valid kind");
            assert_eq!(kind.as_u8(), v);
        }
        assert!(SampleKind::from_u8(0).is_none());
        assert!(SampleKind::from_u8(10).is_none());
    }

    #[test]
    fn unregister_counterparts() {
        assert_eq!(
            SampleKind::RegisterPublisher.unregister_counterpart(),
            Some(SampleKind::UnregisterPublisher)
        );
        assert_eq!(SampleKind::ProcessState.unregister_counterpart(), None);
        assert!(SampleKind::UnregisterClient.is_unregister());
        assert!(!SampleKind::RegisterClient.is_unregister());
    }

    #[test]
    fn to_unregister_bumps_clock() {
        let sample = Sample {
            kind: SampleKind::RegisterPublisher,
            identifier: SampleIdentifier {
                entity: EntityId::from_raw(1),
                process_id: 2,
            },
            endpoint: None,
            registration_clock: 7,
            process: ProcessMeta::default(),
        };
        let un = sample.to_unregister().expect("counterpart");
        assert_eq!(un.kind, SampleKind::UnregisterPublisher);
        assert_eq!(un.registration_clock, 8);
    }
}
