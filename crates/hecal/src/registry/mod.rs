// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration and discovery plane.
//!
//! ```text
//! local entities --(SampleSource)--> SampleStore
//!                                        |
//!                               RegistrationBus tick
//!                                        |
//!                         serialize -> UDP multicast -> peers
//!                                        |
//!                            (loopback delivers our own)
//!                                        |
//!                   recv -> deserialize -> Registry::apply
//!                                        |
//!                       new/deleted entity events -> attachers
//! ```

mod bus;
#[allow(clippy::module_inception)]
mod registry;
mod sample;
pub mod wire;

pub use bus::{RegistrationBus, SampleSource, SampleStore};
pub(crate) use bus::set_reuseport;
pub use registry::{
    ApplyOutcome, CallbackToken, MonitoringSnapshot, RegistrationEvent, RegistrationEventKind,
    Registry,
};
pub use sample::{
    EndpointBlock, EntityCounters, ProcessMeta, Sample, SampleIdentifier, SampleKind,
    TransportLayer, TransportLayerDescriptor,
};
