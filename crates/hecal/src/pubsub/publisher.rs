// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-agnostic publisher facade.
//!
//! A publisher owns one writer per enabled layer and fans every send out
//! to all of them. The data clock increases strictly per successful send;
//! a supplied timestamp overrides the internal one exactly (replay). If no
//! layer could be created the publisher is *degraded*: it still registers
//! its type information, but sends fail.

use super::transport::{shm_writer_options, UdpPayloadWriter, TcpPayloadWriter, WriterTransport};
use super::PublisherEvent;
use crate::config::Configuration;
use crate::core::entity::{DataTypeInformation, EntityId, TopicId};
use crate::core::process;
use crate::error::{Error, Result};
use crate::registry::{
    CallbackToken, EndpointBlock, EntityCounters, ProcessMeta, RegistrationEventKind, Registry,
    Sample, SampleIdentifier, SampleKind, SampleSource, SampleStore, TransportLayer,
    TransportLayerDescriptor,
};
use crate::shm::{channel_base_name, PayloadWriter, ShmWriter, WriteMeta};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Exponential-average weight for new frequency observations.
const FREQUENCY_GAIN: f64 = 0.15;

/// Current wall clock in microseconds since the epoch.
pub(crate) fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

struct PubStats {
    clock: AtomicU64,
    size: AtomicU64,
    drops: AtomicU64,
    frequency_mhz: AtomicU64,
    registration_clock: AtomicU64,
}

/// State shared with the registration bus and the registry callback.
struct PublisherShared {
    id: TopicId,
    datatype: DataTypeInformation,
    layers: Vec<TransportLayerDescriptor>,
    stats: PubStats,
    connections: AtomicUsize,
    event_cb: Mutex<Option<Box<dyn Fn(PublisherEvent) + Send + Sync>>>,
    parameters: String,
}

impl SampleSource for PublisherShared {
    fn sample(&self) -> Sample {
        Sample {
            kind: SampleKind::RegisterPublisher,
            identifier: SampleIdentifier {
                entity: self.id.entity,
                process_id: self.id.process_id,
            },
            endpoint: Some(EndpointBlock {
                name: self.id.topic_name.clone(),
                datatype: self.datatype.clone(),
                layers: self.layers.clone(),
                counters: EntityCounters {
                    clock: self.stats.clock.load(Ordering::Acquire),
                    size: self.stats.size.load(Ordering::Acquire),
                    drops: self.stats.drops.load(Ordering::Acquire),
                    id: self.id.entity.raw(),
                    frequency: self.stats.frequency_mhz.load(Ordering::Acquire),
                },
            }),
            registration_clock: self.stats.registration_clock.load(Ordering::Acquire),
            process: ProcessMeta {
                process_id: self.id.process_id,
                host_name: self.id.host_name.clone(),
                unit_name: self.id.topic_name.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// Publishing endpoint for one topic.
pub struct Publisher {
    shared: Arc<PublisherShared>,
    transports: Vec<WriterTransport>,
    store: Arc<SampleStore>,
    registry: Arc<Registry>,
    registry_token: CallbackToken,
    last_send: Option<Instant>,
}

impl Publisher {
    /// Build the writers for every enabled layer and register the entity.
    pub(crate) fn create(
        topic_name: &str,
        datatype: DataTypeInformation,
        config: &Configuration,
        store: Arc<SampleStore>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let id = TopicId {
            host_name: process::host_name().to_string(),
            process_id: process::process_id(),
            entity: EntityId::generate(),
            topic_name: topic_name.to_string(),
        };

        let mut transports = Vec::new();
        let mut layers = Vec::new();

        if config.shm.enabled {
            let base = channel_base_name(&id.host_name, id.process_id, id.entity);
            match ShmWriter::create(&base, id.entity.raw(), shm_writer_options(&config.shm)) {
                Ok(writer) => {
                    layers.push(TransportLayerDescriptor {
                        version: 1,
                        layer: TransportLayer::Shm {
                            slot_names: writer.slot_names(),
                        },
                    });
                    transports.push(WriterTransport::Shm(writer));
                }
                Err(e) => {
                    // Degraded: advertise type info without the shm layer.
                    log::warn!("[SHM] publisher {topic_name}: segment creation failed: {e}");
                }
            }
        }
        if config.udp.enabled {
            match UdpPayloadWriter::create(config.udp.group, config.udp.port, topic_name) {
                Ok(writer) => {
                    let (group, port) = writer.endpoint();
                    layers.push(TransportLayerDescriptor {
                        version: 1,
                        layer: TransportLayer::Udp {
                            address: group.to_string(),
                            port,
                        },
                    });
                    transports.push(WriterTransport::Udp(writer));
                }
                Err(e) => log::warn!("[UDP] publisher {topic_name}: socket setup failed: {e}"),
            }
        }
        if config.tcp.enabled {
            match TcpPayloadWriter::create() {
                Ok(writer) => {
                    layers.push(TransportLayerDescriptor {
                        version: 1,
                        layer: TransportLayer::Tcp {
                            port: writer.port(),
                        },
                    });
                    transports.push(WriterTransport::Tcp(writer));
                }
                Err(e) => log::warn!("[TCP] publisher {topic_name}: listener setup failed: {e}"),
            }
        }

        let shared = Arc::new(PublisherShared {
            id: id.clone(),
            datatype,
            layers,
            stats: PubStats {
                clock: AtomicU64::new(0),
                size: AtomicU64::new(0),
                drops: AtomicU64::new(0),
                frequency_mhz: AtomicU64::new(0),
                registration_clock: AtomicU64::new(0),
            },
            connections: AtomicUsize::new(0),
            event_cb: Mutex::new(None),
            parameters: config.parameters.clone(),
        });

        store.register(id.entity, Arc::clone(&shared) as Arc<dyn SampleSource>);

        // Subscribers discovered before this publisher existed fire no
        // events; seed the match count from the current registry content.
        let already_matched = registry
            .query_subscribers()
            .iter()
            .filter(|s| s.endpoint_name() == Some(topic_name))
            .count();
        shared.connections.store(already_matched, Ordering::Release);

        // Track matching subscribers for connect/disconnect events.
        let match_shared = Arc::clone(&shared);
        let registry_token = registry.add_event_callback(
            Some(SampleKind::RegisterSubscriber),
            move |event| {
                let Some(name) = event.sample.endpoint_name() else {
                    return;
                };
                if name != match_shared.id.topic_name {
                    return;
                }
                match event.kind {
                    RegistrationEventKind::NewEntity => {
                        match_shared.connections.fetch_add(1, Ordering::AcqRel);
                        match_shared.emit(PublisherEvent::Connected);
                    }
                    RegistrationEventKind::DeletedEntity => {
                        match_shared.connections.fetch_sub(1, Ordering::AcqRel);
                        match_shared.emit(PublisherEvent::Disconnected);
                    }
                }
            },
        );

        log::info!(
            "[NODE] publisher {id} up with {} transport layer(s)",
            shared.layers.len()
        );

        Ok(Self {
            shared,
            transports,
            store,
            registry,
            registry_token,
            last_send: None,
        })
    }

    /// Publish a byte payload. Returns bytes transferred (sum over layers).
    pub fn send(&mut self, payload: &[u8]) -> Result<usize> {
        self.send_stamped(payload, now_us())
    }

    /// Publish with an explicit send timestamp (microseconds since epoch),
    /// overriding the internal one exactly (replay).
    pub fn send_stamped(&mut self, payload: &[u8], timestamp_us: i64) -> Result<usize> {
        self.fan_out(timestamp_us, payload.len(), |transport, meta| {
            transport.write(payload, meta)
        })
    }

    /// Publish via a payload writer callback.
    pub fn send_with(&mut self, payload_writer: &mut dyn PayloadWriter) -> Result<usize> {
        self.send_with_stamped(payload_writer, now_us())
    }

    /// Publish via a payload writer callback with an explicit timestamp.
    pub fn send_with_stamped(
        &mut self,
        payload_writer: &mut dyn PayloadWriter,
        timestamp_us: i64,
    ) -> Result<usize> {
        let len = payload_writer.size();
        self.fan_out(timestamp_us, len, |transport, meta| {
            transport.write_with(payload_writer, meta)
        })
    }

    fn fan_out<F>(&mut self, timestamp_us: i64, payload_len: usize, mut write: F) -> Result<usize>
    where
        F: FnMut(&mut WriterTransport, &WriteMeta) -> std::io::Result<usize>,
    {
        if self.transports.is_empty() {
            return Err(Error::TransportUnavailable(format!(
                "publisher {} has no transport layer",
                self.shared.id
            )));
        }
        let clock = self.shared.stats.clock.load(Ordering::Acquire) + 1;
        let meta = WriteMeta {
            clock,
            timestamp_us,
            publisher_id: self.shared.id.entity.raw(),
        };

        let mut transferred = 0usize;
        let mut any_ok = false;
        for transport in &mut self.transports {
            match write(transport, &meta) {
                Ok(n) => {
                    transferred += n;
                    any_ok = true;
                }
                Err(e) => {
                    log::debug!("[NODE] send on one layer failed: {e}");
                }
            }
        }
        if !any_ok {
            return Err(Error::TransportUnavailable(
                "all transport layers failed".to_string(),
            ));
        }

        self.shared.stats.clock.store(clock, Ordering::Release);
        self.shared
            .stats
            .size
            .store(payload_len as u64, Ordering::Release);
        self.update_frequency();
        Ok(transferred)
    }

    fn update_frequency(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_send {
            let dt = now.duration_since(last).as_secs_f64();
            if dt > 0.0 {
                let instantaneous = 1.0 / dt;
                let previous =
                    self.shared.stats.frequency_mhz.load(Ordering::Acquire) as f64 / 1000.0;
                let smoothed = if previous == 0.0 {
                    instantaneous
                } else {
                    previous * (1.0 - FREQUENCY_GAIN) + instantaneous * FREQUENCY_GAIN
                };
                self.shared
                    .stats
                    .frequency_mhz
                    .store((smoothed * 1000.0) as u64, Ordering::Release);
            }
        }
        self.last_send = Some(now);
    }

    /// Topic identity of this publisher.
    #[must_use]
    pub fn id(&self) -> &TopicId {
        &self.shared.id
    }

    /// Data clock of the last successful send.
    #[must_use]
    pub fn clock(&self) -> u64 {
        self.shared.stats.clock.load(Ordering::Acquire)
    }

    /// Matched subscribers currently known via registration.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Estimated send frequency in mHz.
    #[must_use]
    pub fn frequency_mhz(&self) -> u64 {
        self.shared.stats.frequency_mhz.load(Ordering::Acquire)
    }

    /// Whether no transport layer could be created.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.transports.is_empty()
    }

    /// Install the match/unmatch event callback (must not block).
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(PublisherEvent) + Send + Sync + 'static,
    {
        *self.shared.event_cb.lock() = Some(Box::new(callback));
    }
}

impl PublisherShared {
    fn emit(&self, event: PublisherEvent) {
        if let Some(cb) = self.event_cb.lock().as_ref() {
            cb(event);
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.registry.remove_event_callback(self.registry_token);
        self.store.unregister(self.shared.id.entity);
        log::debug!("[NODE] publisher {} down", self.shared.id);
    }
}
