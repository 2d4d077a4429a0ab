// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hecal - High-throughput inter-process pub/sub and RPC middleware
//!
//! A pure Rust middleware for intra-host and inter-process communication:
//! processes advertise *topics* (typed byte streams) and *services*
//! (request/response methods), discover each other over a UDP multicast
//! registration plane, and exchange payloads over shared memory, UDP or
//! TCP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hecal::{DataTypeInformation, Node};
//!
//! fn main() -> hecal::Result<()> {
//!     let node = Node::builder("my_app").domain_id(0).build()?;
//!
//!     let mut publisher = node.create_publisher("sensors/temperature",
//!         DataTypeInformation::raw())?;
//!     publisher.send(b"23.5")?;
//!
//!     let subscriber = node.create_subscriber("sensors/temperature",
//!         DataTypeInformation::raw())?;
//!     subscriber.set_receive_callback(|_topic, _datatype, data| {
//!         println!("received {} bytes (clock {})", data.buffer.len(), data.clock);
//!     });
//!
//!     node.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                        Application Layer                            |
//! |      Node -> Publisher/Subscriber -> ServiceServer/ServiceClient    |
//! +---------------------------------------------------------------------+
//! |                      Registration Plane                             |
//! |   SampleStore -> RegistrationBus (UDP multicast) -> Registry (TTL)  |
//! +---------------------------------------------------------------------+
//! |                        Transport Layer                              |
//! |   SHM rings (named events/mutex) | UDP datagrams | TCP streams      |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | Explicit runtime handle, factory for all entities |
//! | [`Publisher`] | Publishes byte payloads to a topic |
//! | [`Subscriber`] | Receives payloads from matched publishers |
//! | [`ServiceServer`] | Exposes request/response methods over TCP |
//! | [`ServiceClient`] | Calls discovered service servers |
//! | [`Configuration`] | All tunables, read once at node construction |
//!
//! ## Modules Overview
//!
//! - [`shm`] - shared memory rings, segment layout, named signalling
//! - [`registry`] - registration samples, wire encoding, TTL registry, bus
//! - [`rpc`] - framed TCP request/response sessions
//! - [`sync`] - cross-process named events and mutexes
//! - [`core`] - entity ids, expiring map, thread pool

pub mod config;
pub mod core;
mod error;
mod node;
pub mod pubsub;
pub mod registry;
pub mod rpc;
pub mod shm;
pub mod sync;

pub use config::{
    Configuration, RegistrationConfig, RpcConfig, ShmConfig, TcpConfig, UdpConfig,
};
pub use core::entity::{DataTypeInformation, EntityId, ServiceId, TopicId};
pub use core::expmap::{Clock, ExpiringMap, ManualClock, SystemClockSource};
pub use core::threadpool::{PoolConfig, ThreadPool};
pub use error::{Error, Result};
pub use node::{Node, NodeBuilder, ServiceClient, ServiceServer};
pub use pubsub::{Publisher, PublisherEvent, ReceiveData, Subscriber, SubscriberEvent};
pub use registry::{MonitoringSnapshot, Registry, Sample, SampleKind};
pub use rpc::{CallState, ClientEvent, ServerEvent, ServiceResponse};
pub use shm::PayloadWriter;
pub use sync::{NamedEvent, NamedMutex, WaitResult};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
