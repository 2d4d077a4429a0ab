// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport-agnostic subscriber facade.
//!
//! The registry drives attachment: a new matching publisher triggers one
//! attachment on the best transport (shared memory on the same host, then
//! UDP, then TCP); a deleted publisher detaches. Callbacks for a single
//! source run strictly serialized and in clock order; different sources
//! dispatch in parallel on the thread pool.

use super::transport::{
    shm_reader_options, PayloadSink, ReaderAttachment, TcpPayloadReader, UdpPayloadReader,
};
use super::{ReceiveData, SubscriberEvent};
use crate::config::Configuration;
use crate::core::entity::{DataTypeInformation, EntityId, TopicId};
use crate::core::process;
use crate::core::threadpool::ThreadPool;
use crate::error::Result;
use crate::registry::{
    CallbackToken, EndpointBlock, EntityCounters, ProcessMeta, RegistrationEventKind, Registry,
    Sample, SampleIdentifier, SampleKind, SampleSource, SampleStore, TransportLayer,
};
use crate::shm::{AckHandle, ReceivedPayload, ShmReader};
use arc_swap::ArcSwapOption;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

type ReceiveCallback = Box<dyn Fn(&TopicId, &DataTypeInformation, &ReceiveData<'_>) + Send + Sync>;
type EventCallback = Box<dyn Fn(SubscriberEvent) + Send + Sync>;

/// Per-matched-publisher dispatch state.
///
/// The queue plus in-flight flag serialize callbacks for one source while
/// letting different sources run concurrently.
struct SourceInfo {
    topic_id: TopicId,
    datatype: DataTypeInformation,
    queue: SegQueue<(ReceivedPayload, AckHandle)>,
    in_flight: AtomicBool,
    last_clock: AtomicU64,
}

struct SubscriberInner {
    id: TopicId,
    datatype: DataTypeInformation,
    callback: ArcSwapOption<ReceiveCallback>,
    event_cb: Mutex<Option<EventCallback>>,
    sources: DashMap<u64, Arc<SourceInfo>>,
    attachments: Mutex<HashMap<EntityId, ReaderAttachment>>,
    pool: ThreadPool,
    ttl: Duration,
    received: AtomicU64,
    drops: AtomicU64,
    registration_clock: AtomicU64,
    parameters: String,
}

impl SampleSource for SubscriberInner {
    fn sample(&self) -> Sample {
        Sample {
            kind: SampleKind::RegisterSubscriber,
            identifier: SampleIdentifier {
                entity: self.id.entity,
                process_id: self.id.process_id,
            },
            endpoint: Some(EndpointBlock {
                name: self.id.topic_name.clone(),
                datatype: self.datatype.clone(),
                layers: Vec::new(),
                counters: EntityCounters {
                    clock: self.received.load(Ordering::Acquire),
                    size: 0,
                    drops: self.drops.load(Ordering::Acquire),
                    id: self.id.entity.raw(),
                    frequency: 0,
                },
            }),
            registration_clock: self.registration_clock.load(Ordering::Acquire),
            process: ProcessMeta {
                process_id: self.id.process_id,
                host_name: self.id.host_name.clone(),
                unit_name: self.id.topic_name.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

impl SubscriberInner {
    fn emit(&self, event: SubscriberEvent) {
        if let Some(cb) = self.event_cb.lock().as_ref() {
            cb(event);
        }
    }
}

/// Subscribing endpoint for one topic.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
    store: Arc<SampleStore>,
    registry: Arc<Registry>,
    registry_token: CallbackToken,
}

impl Subscriber {
    /// Register the entity and start matching against known publishers.
    pub(crate) fn create(
        topic_name: &str,
        datatype: DataTypeInformation,
        config: &Configuration,
        store: Arc<SampleStore>,
        registry: Arc<Registry>,
        pool: ThreadPool,
    ) -> Result<Self> {
        let id = TopicId {
            host_name: process::host_name().to_string(),
            process_id: process::process_id(),
            entity: EntityId::generate(),
            topic_name: topic_name.to_string(),
        };

        let inner = Arc::new(SubscriberInner {
            id: id.clone(),
            datatype,
            callback: ArcSwapOption::empty(),
            event_cb: Mutex::new(None),
            sources: DashMap::new(),
            attachments: Mutex::new(HashMap::new()),
            pool,
            ttl: config.registration.ttl,
            received: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            registration_clock: AtomicU64::new(0),
            parameters: config.parameters.clone(),
        });

        store.register(id.entity, Arc::clone(&inner) as Arc<dyn SampleSource>);

        // React to publishers appearing and disappearing. The registry
        // callback must stay non-blocking, so the actual attach/detach work
        // moves to the pool.
        let event_inner = Arc::clone(&inner);
        let registry_token = registry.add_event_callback(
            Some(SampleKind::RegisterPublisher),
            move |event| {
                if event.sample.endpoint_name() != Some(event_inner.id.topic_name.as_str()) {
                    return;
                }
                let inner = Arc::clone(&event_inner);
                let sample = event.sample.clone();
                match event.kind {
                    RegistrationEventKind::NewEntity => {
                        inner.pool.clone().post(move || attach_publisher(&inner, &sample));
                    }
                    RegistrationEventKind::DeletedEntity => {
                        inner
                            .pool
                            .clone()
                            .post(move || detach_publisher(&inner, sample.identifier.entity));
                    }
                }
            },
        );

        // Publishers discovered before this subscriber existed fire no
        // events; pick them up from the current registry content.
        for sample in registry.query_publishers() {
            if sample.endpoint_name() == Some(topic_name) {
                let inner = Arc::clone(&inner);
                inner
                    .pool
                    .clone()
                    .post(move || attach_publisher(&inner, &sample));
            }
        }

        log::info!("[NODE] subscriber {id} up");
        Ok(Self {
            inner,
            store,
            registry,
            registry_token,
        })
    }

    /// Install the receive callback invoked once per message.
    pub fn set_receive_callback<F>(&self, callback: F)
    where
        F: Fn(&TopicId, &DataTypeInformation, &ReceiveData<'_>) + Send + Sync + 'static,
    {
        self.inner.callback.store(Some(Arc::new(Box::new(callback))));
    }

    /// Remove the receive callback.
    pub fn clear_receive_callback(&self) {
        self.inner.callback.store(None);
    }

    /// Install the match/unmatch event callback (must not block).
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(SubscriberEvent) + Send + Sync + 'static,
    {
        *self.inner.event_cb.lock() = Some(Box::new(callback));
    }

    /// Publishers currently attached.
    #[must_use]
    pub fn publisher_count(&self) -> usize {
        self.inner.attachments.lock().len()
    }

    /// Messages delivered to the callback.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.inner.received.load(Ordering::Acquire)
    }

    /// Messages lost across all sources (clock gaps).
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.inner.drops.load(Ordering::Acquire)
    }

    /// Topic identity of this subscriber.
    #[must_use]
    pub fn id(&self) -> &TopicId {
        &self.inner.id
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.registry.remove_event_callback(self.registry_token);
        self.store.unregister(self.inner.id.entity);
        let attachments: Vec<ReaderAttachment> = {
            let mut map = self.inner.attachments.lock();
            map.drain().map(|(_, a)| a).collect()
        };
        for attachment in attachments {
            attachment.detach();
        }
        log::debug!("[NODE] subscriber {} down", self.inner.id);
    }
}

/// Attach to one remote publisher on the best available layer.
fn attach_publisher(inner: &Arc<SubscriberInner>, sample: &Sample) {
    let Some(block) = &sample.endpoint else {
        return;
    };
    let entity = sample.identifier.entity;
    {
        let attachments = inner.attachments.lock();
        if attachments.contains_key(&entity) {
            return; // refresh of an already attached publisher
        }
    }
    if block.datatype != inner.datatype
        && !block.datatype.type_name.is_empty()
        && !inner.datatype.type_name.is_empty()
    {
        log::warn!(
            "[NODE] topic {}: datatype mismatch ({} vs {}), attaching anyway",
            inner.id.topic_name,
            block.datatype.type_name,
            inner.datatype.type_name
        );
    }

    let source = Arc::new(SourceInfo {
        topic_id: TopicId {
            host_name: sample.process.host_name.clone(),
            process_id: sample.identifier.process_id,
            entity,
            topic_name: inner.id.topic_name.clone(),
        },
        datatype: block.datatype.clone(),
        queue: SegQueue::new(),
        in_flight: AtomicBool::new(false),
        last_clock: AtomicU64::new(0),
    });
    inner.sources.insert(entity.raw(), Arc::clone(&source));

    let sink: PayloadSink = {
        let inner = Arc::clone(inner);
        let source = Arc::clone(&source);
        Arc::new(move |msg, ack| dispatch(&inner, &source, msg, ack))
    };

    let local = sample.is_local_to(&inner.id.host_name);
    let attachment = select_attachment(inner, sample, block, local, sink);

    match attachment {
        Some(attachment) => {
            inner.attachments.lock().insert(entity, attachment);
            inner.emit(SubscriberEvent::Connected);
            log::debug!(
                "[NODE] topic {}: attached to publisher {entity}",
                inner.id.topic_name
            );
        }
        None => {
            inner.sources.remove(&entity.raw());
            log::debug!(
                "[NODE] topic {}: no usable transport layer for publisher {entity}",
                inner.id.topic_name
            );
        }
    }
}

/// Transport preference: shm on the same host, then UDP, then TCP.
fn select_attachment(
    inner: &Arc<SubscriberInner>,
    sample: &Sample,
    block: &EndpointBlock,
    local: bool,
    sink: PayloadSink,
) -> Option<ReaderAttachment> {
    if local {
        for descriptor in &block.layers {
            if let TransportLayer::Shm { slot_names } = &descriptor.layer {
                let reader = ShmReader::attach(
                    slot_names.clone(),
                    shm_reader_options(inner.ttl),
                    sink,
                );
                return Some(ReaderAttachment::Shm(reader));
            }
        }
    }
    for descriptor in &block.layers {
        if let TransportLayer::Udp { address, port } = &descriptor.layer {
            let Ok(group) = address.parse() else {
                continue;
            };
            match UdpPayloadReader::attach(
                group,
                *port,
                &inner.id.topic_name,
                sample.identifier.entity.raw(),
                Arc::clone(&sink),
            ) {
                Ok(reader) => return Some(ReaderAttachment::Udp(reader)),
                Err(e) => log::debug!("[UDP] attach failed: {e}"),
            }
        }
    }
    for descriptor in &block.layers {
        if let TransportLayer::Tcp { port } = &descriptor.layer {
            match TcpPayloadReader::attach(
                &sample.process.host_name,
                *port,
                sample.identifier.entity.raw(),
                Arc::clone(&sink),
            ) {
                Ok(reader) => return Some(ReaderAttachment::Tcp(reader)),
                Err(e) => log::debug!("[TCP] attach failed: {e}"),
            }
        }
    }
    None
}

fn detach_publisher(inner: &Arc<SubscriberInner>, entity: EntityId) {
    let attachment = inner.attachments.lock().remove(&entity);
    if let Some(attachment) = attachment {
        attachment.detach();
        inner.sources.remove(&entity.raw());
        inner.emit(SubscriberEvent::Disconnected);
        log::debug!(
            "[NODE] topic {}: detached from publisher {entity}",
            inner.id.topic_name
        );
    }
}

/// Enqueue one message and make sure a drain job is running.
fn dispatch(
    inner: &Arc<SubscriberInner>,
    source: &Arc<SourceInfo>,
    msg: ReceivedPayload,
    ack: AckHandle,
) {
    source.queue.push((msg, ack));
    if !source.in_flight.swap(true, Ordering::AcqRel) {
        let inner = Arc::clone(inner);
        let source = Arc::clone(source);
        inner.pool.clone().post(move || drain_source(&inner, &source));
    }
}

/// Deliver queued messages of one source in clock order.
fn drain_source(inner: &Arc<SubscriberInner>, source: &Arc<SourceInfo>) {
    loop {
        while let Some((msg, ack)) = source.queue.pop() {
            let last = source.last_clock.load(Ordering::Acquire);
            if msg.clock <= last {
                // Out-of-order clocks are dropped, never delivered.
                ack.ack();
                continue;
            }
            if last > 0 {
                let gap = msg.clock - last - 1;
                if gap > 0 {
                    inner.drops.fetch_add(gap, Ordering::AcqRel);
                    inner.emit(SubscriberEvent::Dropped(gap));
                }
            }
            source.last_clock.store(msg.clock, Ordering::Release);

            if let Some(callback) = inner.callback.load_full() {
                let data = ReceiveData {
                    buffer: &msg.data,
                    id: msg.publisher_id,
                    time_us: msg.timestamp_us,
                    clock: msg.clock,
                };
                (*callback)(&source.topic_id, &source.datatype, &data);
            }
            inner.received.fetch_add(1, Ordering::AcqRel);
            ack.ack();
        }
        source.in_flight.store(false, Ordering::Release);
        if source.queue.is_empty() {
            break;
        }
        // A message slipped in between the final pop and the flag reset.
        if source.in_flight.swap(true, Ordering::AcqRel) {
            break;
        }
    }
}
