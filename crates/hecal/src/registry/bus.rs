// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration bus: periodic sample broadcast over UDP multicast.
//!
//! A tick thread gathers the local entities' current samples, serializes
//! and multicasts them, and sweeps the registry for expired peers. A
//! receive thread parses incoming datagrams (reassembling fragments per
//! sender) and applies them to the registry. Multicast loopback delivers
//! local samples to the local registry through the same path, which is how
//! same-host and same-process matching works.
//!
//! Graceful shutdown broadcasts unregister samples; peers that die
//! ungracefully age out via the registry TTL.

use super::registry::Registry;
use super::sample::Sample;
use super::wire::{self, Defragmenter};
use crate::config::RegistrationConfig;
use crate::core::entity::EntityId;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Provider of an entity's current registration sample.
///
/// Entities (publishers, subscribers, servers, clients, the process itself)
/// implement this; the bus polls them once per tick so counters are fresh.
pub trait SampleSource: Send + Sync {
    /// The entity's current sample.
    fn sample(&self) -> Sample;
}

/// Registry of local sample sources plus queued unregister samples.
#[derive(Default)]
pub struct SampleStore {
    sources: DashMap<EntityId, Arc<dyn SampleSource>>,
    pending_unregister: Mutex<Vec<Sample>>,
}

impl SampleStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a local entity.
    pub fn register(&self, entity: EntityId, source: Arc<dyn SampleSource>) {
        self.sources.insert(entity, source);
    }

    /// Remove a local entity, queueing its unregister sample for the next
    /// broadcast.
    pub fn unregister(&self, entity: EntityId) {
        if let Some((_, source)) = self.sources.remove(&entity) {
            if let Some(un) = source.sample().to_unregister() {
                self.pending_unregister.lock().push(un);
            }
        }
    }

    /// Current samples of all registered entities.
    #[must_use]
    pub fn collect(&self) -> Vec<Sample> {
        self.sources.iter().map(|e| e.value().sample()).collect()
    }

    /// Drain queued unregister samples.
    #[must_use]
    pub fn take_unregisters(&self) -> Vec<Sample> {
        std::mem::take(&mut *self.pending_unregister.lock())
    }

    /// Number of live local entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no local entities exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Periodic broadcast/sink of registration samples.
pub struct RegistrationBus {
    cancel: Arc<AtomicBool>,
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    store: Arc<SampleStore>,
    config: RegistrationConfig,
    tick_handle: Option<JoinHandle<()>>,
    recv_handle: Option<JoinHandle<()>>,
}

impl RegistrationBus {
    /// Bind the multicast socket and start the tick and receive threads.
    pub fn start(
        config: RegistrationConfig,
        store: Arc<SampleStore>,
        registry: Arc<Registry>,
    ) -> io::Result<Self> {
        let socket = Arc::new(open_multicast_socket(&config)?);
        let destination = SocketAddr::V4(SocketAddrV4::new(config.group, config.port));
        let cancel = Arc::new(AtomicBool::new(false));

        log::info!(
            "[REG] bus up, group {}:{} domain {} period {:?}",
            config.group,
            config.port,
            config.domain_id,
            config.period
        );

        let tick_handle = {
            let cancel = Arc::clone(&cancel);
            let socket = Arc::clone(&socket);
            let store = Arc::clone(&store);
            let registry = Arc::clone(&registry);
            let config = config.clone();
            std::thread::Builder::new()
                .name("hecal-regtx".to_string())
                .spawn(move || tick_loop(&config, &socket, destination, &store, &registry, &cancel))?
        };

        let recv_handle = {
            let cancel = Arc::clone(&cancel);
            let socket = Arc::clone(&socket);
            let config = config.clone();
            std::thread::Builder::new()
                .name("hecal-regrx".to_string())
                .spawn(move || recv_loop(&config, &socket, &registry, &cancel))?
        };

        Ok(Self {
            cancel,
            socket,
            destination,
            store,
            config,
            tick_handle: Some(tick_handle),
            recv_handle: Some(recv_handle),
        })
    }

    /// Broadcast one batch of samples immediately (outside the tick).
    pub fn broadcast_now(&self, samples: &[Sample]) {
        send_samples(
            &self.socket,
            self.destination,
            self.config.domain_id,
            samples,
        );
    }

    /// Broadcast unregister samples for every local entity and stop both
    /// threads. The bus is one-shot.
    pub fn stop(&mut self) {
        if self.cancel.swap(true, Ordering::AcqRel) {
            return;
        }
        // Graceful departure: explicit unregisters, then silence.
        let mut goodbye: Vec<Sample> = self
            .store
            .collect()
            .iter()
            .filter_map(Sample::to_unregister)
            .collect();
        goodbye.extend(self.store.take_unregisters());
        if !goodbye.is_empty() {
            log::debug!("[REG] broadcasting {} unregister samples", goodbye.len());
            send_samples(
                &self.socket,
                self.destination,
                self.config.domain_id,
                &goodbye,
            );
        }
        if let Some(handle) = self.tick_handle.take() {
            handle.join().ok();
        }
        if let Some(handle) = self.recv_handle.take() {
            handle.join().ok();
        }
    }
}

impl Drop for RegistrationBus {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Set SO_REUSEPORT so several processes (and several nodes in one test
/// binary) can bind the same registration port on one host.
#[cfg(unix)]
pub(crate) fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, a standard socket option and
    // a correctly sized optval pointer.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::from_ref(&optval).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_reuseport(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// Bind 0.0.0.0:<port> with address/port reuse, join the group on every
/// usable interface, enable loopback.
fn open_multicast_socket(config: &RegistrationConfig) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    set_reuseport(&socket)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();

    join_group_all_interfaces(&socket, config.group);
    socket.set_multicast_loop_v4(config.loopback)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    Ok(socket)
}

/// Join the group on all non-loopback IPv4 interfaces, falling back to the
/// unspecified interface. Already-joined errors are tolerated.
fn join_group_all_interfaces(socket: &UdpSocket, group: Ipv4Addr) {
    let mut joined = 0usize;
    if let Ok(interfaces) = local_ip_address::list_afinet_netifas() {
        for (name, addr) in interfaces {
            let std::net::IpAddr::V4(v4) = addr else {
                continue;
            };
            if v4.is_loopback() {
                continue;
            }
            match socket.join_multicast_v4(&group, &v4) {
                Ok(()) => {
                    log::debug!("[REG] joined {group} on {name} ({v4})");
                    joined += 1;
                }
                Err(e) if e.raw_os_error() == Some(libc::EADDRINUSE) => {
                    // Same physical NIC seen twice; already joined.
                    joined += 1;
                }
                Err(e) => {
                    log::debug!("[REG] join {group} on {name} ({v4}) failed (non-fatal): {e}");
                }
            }
        }
    }
    if joined == 0 {
        if let Err(e) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            log::warn!("[REG] join {group} on UNSPECIFIED failed: {e}");
        }
    }
}

fn tick_loop(
    config: &RegistrationConfig,
    socket: &UdpSocket,
    destination: SocketAddr,
    store: &SampleStore,
    registry: &Registry,
    cancel: &AtomicBool,
) {
    while !cancel.load(Ordering::Acquire) {
        let mut batch = store.collect();
        batch.extend(store.take_unregisters());
        send_samples(socket, destination, config.domain_id, &batch);

        registry.expire(Instant::now());

        // Sleep one period in slices so stop() stays prompt.
        let deadline = Instant::now() + config.period;
        while !cancel.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

fn send_samples(socket: &UdpSocket, destination: SocketAddr, domain_id: u16, samples: &[Sample]) {
    for sample in samples {
        let bytes = wire::serialize_sample(sample);
        for datagram in wire::encode_datagrams(domain_id, &bytes) {
            if let Err(e) = socket.send_to(&datagram, destination) {
                // Logged and retried next tick; registration is never fatal.
                log::debug!("[REG] send to {destination} failed: {e}");
                return;
            }
        }
    }
}

fn recv_loop(
    config: &RegistrationConfig,
    socket: &UdpSocket,
    registry: &Registry,
    cancel: &AtomicBool,
) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut assemblers: HashMap<SocketAddr, Defragmenter> = HashMap::new();

    while !cancel.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::debug!("[REG] recv failed: {e}");
                continue;
            }
        };

        let view = match wire::parse_datagram(&buf[..len]) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("[REG] dropping datagram from {from}: {e}");
                continue;
            }
        };
        if view.domain_id != config.domain_id {
            continue;
        }

        let assembler = assemblers.entry(from).or_default();
        let complete = match assembler.push(&view) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("[REG] fragment stream from {from} reset: {e}");
                continue;
            }
        };

        match wire::deserialize_sample(&complete) {
            Ok(sample) => {
                registry.apply(sample);
            }
            Err(e) => {
                log::debug!("[REG] undecodable sample from {from}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::DataTypeInformation;
    use crate::registry::sample::{
        EndpointBlock, EntityCounters, ProcessMeta, SampleIdentifier, SampleKind,
    };

    struct FixedSource(Sample);

    impl SampleSource for FixedSource {
        fn sample(&self) -> Sample {
            self.0.clone()
        }
    }

    fn sample(entity: u64) -> Sample {
        Sample {
            kind: SampleKind::RegisterPublisher,
            identifier: SampleIdentifier {
                entity: EntityId::from_raw(entity),
                process_id: std::process::id(),
            },
            endpoint: Some(EndpointBlock {
                name: "bus_topic".to_string(),
                datatype: DataTypeInformation::raw(),
                layers: Vec::new(),
                counters: EntityCounters::default(),
            }),
            registration_clock: 0,
            process: ProcessMeta {
                process_id: std::process::id(),
                host_name: "box".to_string(),
                unit_name: "bus_test".to_string(),
                parameters: String::new(),
            },
        }
    }

    #[test]
    fn store_collects_and_unregisters() {
        let store = SampleStore::new();
        let entity = EntityId::from_raw(1);
        store.register(entity, Arc::new(FixedSource(sample(1))));
        assert_eq!(store.len(), 1);
        assert_eq!(store.collect().len(), 1);

        store.unregister(entity);
        assert!(store.is_empty());
        let pending = store.take_unregisters();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, SampleKind::UnregisterPublisher);
        // Drained.
        assert!(store.take_unregisters().is_empty());
    }

    /// Distinct ports per test avoid crosstalk under `cargo test`.
    fn test_config(port: u16) -> RegistrationConfig {
        RegistrationConfig {
            period: Duration::from_millis(50),
            ttl: Duration::from_millis(400),
            port,
            domain_id: fastrand::u16(1..),
            ..Default::default()
        }
    }

    #[test]
    fn local_samples_reach_local_registry_via_loopback() {
        let config = test_config(24_101);
        let store = Arc::new(SampleStore::new());
        let registry = Arc::new(Registry::new(config.ttl));
        store.register(EntityId::from_raw(7), Arc::new(FixedSource(sample(7))));

        let mut bus =
            RegistrationBus::start(config, Arc::clone(&store), Arc::clone(&registry))
                .expect("bus");

        let deadline = Instant::now() + Duration::from_secs(3);
        while registry.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(registry.len(), 1);
        bus.stop();
    }

    #[test]
    fn entities_expire_after_silence() {
        let config = test_config(24_102);
        let store = Arc::new(SampleStore::new());
        let registry = Arc::new(Registry::new(config.ttl));
        let entity = EntityId::from_raw(9);
        store.register(entity, Arc::new(FixedSource(sample(9))));

        let mut bus =
            RegistrationBus::start(config, Arc::clone(&store), Arc::clone(&registry))
                .expect("bus");

        let deadline = Instant::now() + Duration::from_secs(3);
        while registry.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!registry.is_empty());

        // Stop announcing (but keep ticking) and wait out the TTL.
        store.sources.remove(&entity);
        let deadline = Instant::now() + Duration::from_secs(3);
        while !registry.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(registry.is_empty());
        bus.stop();
    }

    #[test]
    fn foreign_domain_samples_are_filtered() {
        let mut config_a = test_config(24_103);
        config_a.domain_id = 100;
        let mut config_b = test_config(24_103);
        config_b.domain_id = 200;

        let store_a = Arc::new(SampleStore::new());
        let registry_a = Arc::new(Registry::new(config_a.ttl));
        store_a.register(EntityId::from_raw(1), Arc::new(FixedSource(sample(1))));

        let store_b = Arc::new(SampleStore::new());
        let registry_b = Arc::new(Registry::new(config_b.ttl));

        let mut bus_a =
            RegistrationBus::start(config_a, store_a, Arc::clone(&registry_a)).expect("bus a");
        let mut bus_b =
            RegistrationBus::start(config_b, store_b, Arc::clone(&registry_b)).expect("bus b");

        std::thread::sleep(Duration::from_millis(300));
        assert!(!registry_a.is_empty(), "own domain sees the sample");
        assert!(registry_b.is_empty(), "foreign domain must not");
        bus_a.stop();
        bus_b.stop();
    }
}
