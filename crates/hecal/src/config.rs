// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! One [`Configuration`] is read at node construction and never re-read;
//! environment variables are not consulted. Invalid combinations fail
//! construction with a configuration error.

use crate::core::threadpool::PoolConfig;
use crate::error::{Error, Result};
use crate::shm::MAX_BUFFER_COUNT;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Default registration multicast group.
pub const DEFAULT_REGISTRATION_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);
/// Default registration multicast port.
pub const DEFAULT_REGISTRATION_PORT: u16 = 14000;
/// Default payload multicast group (UDP transport).
pub const DEFAULT_PAYLOAD_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 2);
/// Default payload multicast port (UDP transport).
pub const DEFAULT_PAYLOAD_PORT: u16 = 14010;
/// Default registry entry TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
/// Default registration broadcast period.
pub const DEFAULT_REGISTRATION_PERIOD: Duration = Duration::from_secs(1);

/// Registration plane settings.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Broadcast period.
    pub period: Duration,
    /// Registry entry TTL (entities expire after this much silence).
    pub ttl: Duration,
    /// Multicast group for registration gossip.
    pub group: Ipv4Addr,
    /// Multicast port for registration gossip.
    pub port: u16,
    /// Domain id; datagrams from other domains are dropped.
    pub domain_id: u16,
    /// Deliver own datagrams via multicast loopback (required for
    /// same-host discovery).
    pub loopback: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_REGISTRATION_PERIOD,
            ttl: DEFAULT_TTL,
            group: DEFAULT_REGISTRATION_GROUP,
            port: DEFAULT_REGISTRATION_PORT,
            domain_id: 0,
            loopback: true,
        }
    }
}

/// Shared memory transport settings (per publisher).
#[derive(Debug, Clone)]
pub struct ShmConfig {
    /// Enable the shared memory layer.
    pub enabled: bool,
    /// Ring slots (1..=64).
    pub buffer_count: usize,
    /// Allow in-place payload mutation (effective with one buffer only).
    pub zero_copy: bool,
    /// Wait for subscriber read-acks up to this long; zero disables
    /// acknowledge mode.
    pub ack_timeout: Duration,
    /// Initial payload capacity per slot.
    pub initial_capacity: usize,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_count: 1,
            zero_copy: false,
            ack_timeout: Duration::ZERO,
            initial_capacity: 4096,
        }
    }
}

/// UDP payload transport settings.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Enable the UDP layer.
    pub enabled: bool,
    /// Payload multicast group.
    pub group: Ipv4Addr,
    /// Payload multicast port.
    pub port: u16,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group: DEFAULT_PAYLOAD_GROUP,
            port: DEFAULT_PAYLOAD_PORT,
        }
    }
}

/// TCP payload transport settings.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Enable the TCP layer.
    pub enabled: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

/// RPC settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Default deadline for blocking calls.
    pub call_timeout: Duration,
    /// Connect deadline for client sessions.
    pub connect_timeout: Duration,
    /// Allow the server to process sessions in parallel.
    pub parallel_sessions: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            parallel_sessions: true,
        }
    }
}

/// Complete node configuration.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    /// Registration plane.
    pub registration: RegistrationConfig,
    /// Shared memory transport defaults.
    pub shm: ShmConfig,
    /// UDP payload transport defaults.
    pub udp: UdpConfig,
    /// TCP payload transport defaults.
    pub tcp: TcpConfig,
    /// RPC defaults.
    pub rpc: RpcConfig,
    /// Callback thread pool sizing.
    pub pool: PoolConfig,
    /// Free-form startup parameters announced in process samples.
    pub parameters: String,
}

impl Configuration {
    /// Reject invalid option combinations.
    pub fn validate(&self) -> Result<()> {
        if self.shm.buffer_count == 0 || self.shm.buffer_count > MAX_BUFFER_COUNT {
            return Err(Error::Configuration(format!(
                "shm.buffer_count must be 1..={MAX_BUFFER_COUNT}, got {}",
                self.shm.buffer_count
            )));
        }
        if self.registration.period.is_zero() {
            return Err(Error::Configuration(
                "registration.period must be non-zero".to_string(),
            ));
        }
        if self.registration.ttl < self.registration.period {
            return Err(Error::Configuration(
                "registration.ttl must be at least one period".to_string(),
            ));
        }
        if !self.registration.group.is_multicast() {
            return Err(Error::Configuration(format!(
                "registration.group {} is not a multicast address",
                self.registration.group
            )));
        }
        if self.udp.enabled && !self.udp.group.is_multicast() {
            return Err(Error::Configuration(format!(
                "udp.group {} is not a multicast address",
                self.udp.group
            )));
        }
        if !self.shm.enabled && !self.udp.enabled && !self.tcp.enabled {
            return Err(Error::Configuration(
                "at least one transport layer must be enabled".to_string(),
            ));
        }
        Ok(())
    }
}
