// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Time-expiring registry of remote entities.
//!
//! The single source of truth consulted by subscribers and service clients
//! to decide whom to attach to. Backed by the expiring map under one
//! reader-writer lock; event callbacks fire synchronously under the
//! (downgraded) read lock and therefore must not block or call back into
//! the registry.

use super::sample::{Sample, SampleKind};
use crate::core::entity::EntityId;
use crate::core::expmap::{Clock, ExpiringMap, SystemClockSource};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Registry mutation category delivered to event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEventKind {
    /// First sample for an entity arrived.
    NewEntity,
    /// An entity expired or unregistered.
    DeletedEntity,
}

/// One registry mutation.
#[derive(Debug, Clone)]
pub struct RegistrationEvent {
    /// What happened.
    pub kind: RegistrationEventKind,
    /// The entity's (last known) registration state.
    pub sample: Sample,
}

/// Outcome of applying one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entity appeared (event fired).
    Added,
    /// An existing entity was refreshed.
    Refreshed,
    /// An unregister removed the entity (event fired).
    Removed,
    /// The sample was stale or targeted an unknown entity.
    Ignored,
}

/// Handle for removing an event callback.
pub type CallbackToken = u64;

type EventCallback = Box<dyn Fn(&RegistrationEvent) + Send + Sync>;

/// Thread-safe registry of remote entities with TTL expiry.
pub struct Registry<C: Clock = SystemClockSource> {
    entries: RwLock<ExpiringMap<EntityId, Sample, C>>,
    callbacks: DashMap<CallbackToken, (Option<SampleKind>, EventCallback)>,
    next_token: AtomicU64,
}

impl Registry<SystemClockSource> {
    /// Create a registry with the given entry TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, SystemClockSource)
    }
}

impl<C: Clock> Registry<C> {
    /// Create a registry with an injected clock (tests).
    pub fn with_clock(ttl: Duration, clock: C) -> Self {
        Self {
            entries: RwLock::new(ExpiringMap::with_clock(ttl, clock)),
            callbacks: DashMap::new(),
            next_token: AtomicU64::new(1),
        }
    }

    /// Upsert an entity from a received sample.
    ///
    /// Registration clocks are monotonic per entity: a sample older than
    /// the stored one is ignored. Unregister samples remove the entity and
    /// emit exactly one deleted event; repeats are no-ops.
    pub fn apply(&self, sample: Sample) -> ApplyOutcome {
        if sample.kind.is_unregister() {
            let mut entries = self.entries.write();
            let Some(old) = entries.erase(&sample.identifier.entity) else {
                return ApplyOutcome::Ignored;
            };
            let entries = parking_lot::RwLockWriteGuard::downgrade(entries);
            self.emit(&entries, RegistrationEventKind::DeletedEntity, old);
            return ApplyOutcome::Removed;
        }

        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&sample.identifier.entity) {
            if sample.registration_clock < existing.registration_clock {
                log::debug!(
                    "[REG] stale sample for {} ignored (clock {} < {})",
                    sample.identifier.entity,
                    sample.registration_clock,
                    existing.registration_clock
                );
                return ApplyOutcome::Ignored;
            }
            entries.insert(sample.identifier.entity, sample);
            return ApplyOutcome::Refreshed;
        }

        entries.insert(sample.identifier.entity, sample.clone());
        let entries = parking_lot::RwLockWriteGuard::downgrade(entries);
        self.emit(&entries, RegistrationEventKind::NewEntity, sample);
        ApplyOutcome::Added
    }

    /// Evict entries not refreshed within the TTL, emitting deleted events.
    /// Returns the number of evictions.
    pub fn expire(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let evicted = entries.erase_expired(now);
        if evicted.is_empty() {
            return 0;
        }
        let count = evicted.len();
        let entries = parking_lot::RwLockWriteGuard::downgrade(entries);
        for (entity, sample) in evicted {
            log::debug!("[REG] entity {entity} expired");
            self.emit(&entries, RegistrationEventKind::DeletedEntity, sample);
        }
        count
    }

    fn emit<G>(&self, _read_guard: &G, kind: RegistrationEventKind, sample: Sample) {
        let event = RegistrationEvent { kind, sample };
        for entry in self.callbacks.iter() {
            let (filter, callback) = entry.value();
            if filter.is_none() || *filter == Some(event.sample.kind) {
                callback(&event);
            }
        }
    }

    /// Register an event callback, optionally filtered to one sample kind.
    ///
    /// Callbacks run synchronously inside `apply` / `expire` under the read
    /// lock: keep them non-blocking and never touch the registry from them.
    pub fn add_event_callback<F>(&self, filter: Option<SampleKind>, callback: F) -> CallbackToken
    where
        F: Fn(&RegistrationEvent) + Send + Sync + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.callbacks.insert(token, (filter, Box::new(callback)));
        token
    }

    /// Remove a previously registered callback.
    pub fn remove_event_callback(&self, token: CallbackToken) {
        self.callbacks.remove(&token);
    }

    /// Entity count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the registry holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Look up one entity's current sample.
    #[must_use]
    pub fn get(&self, entity: EntityId) -> Option<Sample> {
        self.entries.read().get(&entity).cloned()
    }

    fn query(&self, kind: SampleKind) -> Vec<Sample> {
        self.entries
            .read()
            .iter()
            .filter(|(_, s)| s.kind == kind)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Snapshot of all known publishers.
    #[must_use]
    pub fn query_publishers(&self) -> Vec<Sample> {
        self.query(SampleKind::RegisterPublisher)
    }

    /// Snapshot of all known subscribers.
    #[must_use]
    pub fn query_subscribers(&self) -> Vec<Sample> {
        self.query(SampleKind::RegisterSubscriber)
    }

    /// Snapshot of all known servers.
    #[must_use]
    pub fn query_servers(&self) -> Vec<Sample> {
        self.query(SampleKind::RegisterServer)
    }

    /// Snapshot of all known clients.
    #[must_use]
    pub fn query_clients(&self) -> Vec<Sample> {
        self.query(SampleKind::RegisterClient)
    }

    /// Aggregate view over everything currently registered.
    #[must_use]
    pub fn monitoring(&self) -> MonitoringSnapshot {
        let entries = self.entries.read();
        let mut snapshot = MonitoringSnapshot::default();
        for (_, sample) in entries.iter() {
            let bucket = match sample.kind {
                SampleKind::RegisterPublisher => &mut snapshot.publishers,
                SampleKind::RegisterSubscriber => &mut snapshot.subscribers,
                SampleKind::RegisterServer => &mut snapshot.servers,
                SampleKind::RegisterClient => &mut snapshot.clients,
                SampleKind::ProcessState => &mut snapshot.processes,
                _ => continue,
            };
            bucket.push(sample.clone());
        }
        snapshot
    }
}

/// Registry content grouped by entity kind.
#[derive(Debug, Default, Clone)]
pub struct MonitoringSnapshot {
    /// Process-state entries.
    pub processes: Vec<Sample>,
    /// Publisher entries.
    pub publishers: Vec<Sample>,
    /// Subscriber entries.
    pub subscribers: Vec<Sample>,
    /// Server entries.
    pub servers: Vec<Sample>,
    /// Client entries.
    pub clients: Vec<Sample>,
}
