// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The node: explicit runtime handle and entity factory.
//!
//! A node owns the process-wide pieces (registry, registration bus, thread
//! pool, RPC I/O context) and hands out publishers, subscribers, service
//! servers and service clients. There is no global state; everything hangs
//! off the node, and `shutdown()` is the explicit teardown:
//!
//! ```no_run
//! use hecal::{Node, DataTypeInformation};
//!
//! let node = Node::builder("sensor_node").build()?;
//! let mut publisher = node.create_publisher("temperature", DataTypeInformation::raw())?;
//! publisher.send(b"23.5")?;
//! node.shutdown();
//! # Ok::<(), hecal::Error>(())
//! ```

use crate::config::Configuration;
use crate::core::entity::{DataTypeInformation, EntityId, ServiceId};
use crate::core::process;
use crate::core::threadpool::ThreadPool;
use crate::error::{Error, Result};
use crate::pubsub::{Publisher, Subscriber};
use crate::registry::{
    EndpointBlock, EntityCounters, MonitoringSnapshot, ProcessMeta, RegistrationBus, Registry,
    Sample, SampleIdentifier, SampleKind, SampleSource, SampleStore, TransportLayer,
    TransportLayerDescriptor,
};
use crate::rpc::{
    ClientManager, ClientSession, IoContext, ServerEvent, ServerManager, ServiceResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Builder for [`Node`].
pub struct NodeBuilder {
    name: String,
    config: Configuration,
}

impl NodeBuilder {
    /// Set the domain id (nodes only discover peers in their domain).
    #[must_use]
    pub fn domain_id(mut self, domain_id: u16) -> Self {
        self.config.registration.domain_id = domain_id;
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn configuration(mut self, config: Configuration) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and bring the node up.
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;

        let host_name = process::host_name();
        let cleaned = crate::shm::cleanup_stale_segments(host_name);
        if cleaned > 0 {
            log::info!("[NODE] removed {cleaned} stale shm segments at startup");
        }

        let pool = ThreadPool::new(self.config.pool.clone());
        let registry = Arc::new(Registry::new(self.config.registration.ttl));
        let store = Arc::new(SampleStore::new());

        // Announce the process itself.
        let process_entity = EntityId::generate();
        store.register(
            process_entity,
            Arc::new(ProcessSource {
                entity: process_entity,
                unit_name: self.name.clone(),
                parameters: self.config.parameters.clone(),
                registration_clock: AtomicU64::new(0),
            }),
        );

        let bus = RegistrationBus::start(
            self.config.registration.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
        )
        .map_err(|e| Error::ResourceExhaustion(format!("registration socket: {e}")))?;

        log::info!("[NODE] {} up on host {host_name}", self.name);
        Ok(Node {
            name: self.name,
            config: self.config,
            pool,
            registry,
            store,
            bus: Mutex::new(Some(bus)),
            rpc: Mutex::new(None),
            down: AtomicBool::new(false),
        })
    }
}

/// Lazily created RPC plumbing (event loop + both managers).
struct RpcRuntime {
    io: Arc<IoContext>,
    servers: Arc<ServerManager>,
    clients: Arc<ClientManager>,
}

/// Process node: explicit runtime handle and factory for all entities.
pub struct Node {
    name: String,
    config: Configuration,
    pool: ThreadPool,
    registry: Arc<Registry>,
    store: Arc<SampleStore>,
    bus: Mutex<Option<RegistrationBus>>,
    rpc: Mutex<Option<RpcRuntime>>,
    down: AtomicBool,
}

impl Node {
    /// Start building a node with default configuration.
    #[must_use]
    pub fn builder(name: &str) -> NodeBuilder {
        NodeBuilder {
            name: name.to_string(),
            config: Configuration::default(),
        }
    }

    /// Node name (the unit name in process samples).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a publisher on a topic.
    pub fn create_publisher(
        &self,
        topic_name: &str,
        datatype: DataTypeInformation,
    ) -> Result<Publisher> {
        self.ensure_up()?;
        Publisher::create(
            topic_name,
            datatype,
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
        )
    }

    /// Create a subscriber on a topic.
    pub fn create_subscriber(
        &self,
        topic_name: &str,
        datatype: DataTypeInformation,
    ) -> Result<Subscriber> {
        self.ensure_up()?;
        Subscriber::create(
            topic_name,
            datatype,
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.pool.clone(),
        )
    }

    /// Create a service server.
    pub fn create_service_server(&self, service_name: &str) -> Result<ServiceServer> {
        self.ensure_up()?;
        let (servers, _) = self.rpc_runtime()?;
        let server = servers
            .create_server()
            .map_err(|e| Error::ResourceExhaustion(format!("rpc listener: {e}")))?;

        let id = ServiceId {
            host_name: process::host_name().to_string(),
            process_id: process::process_id(),
            entity: EntityId::generate(),
            service_name: service_name.to_string(),
        };
        let shared = Arc::new(ServiceShared {
            id: id.clone(),
            kind: SampleKind::RegisterServer,
            port: server.port(),
            registration_clock: AtomicU64::new(0),
            parameters: self.config.parameters.clone(),
        });
        self.store
            .register(id.entity, Arc::clone(&shared) as Arc<dyn SampleSource>);

        log::info!("[NODE] service server {service_name} on port {}", server.port());
        Ok(ServiceServer {
            server,
            id,
            store: Arc::clone(&self.store),
        })
    }

    /// Create a service client. Sessions are opened lazily against servers
    /// discovered via registration.
    pub fn create_service_client(&self, service_name: &str) -> Result<ServiceClient> {
        self.ensure_up()?;
        let (_, clients) = self.rpc_runtime()?;

        let id = ServiceId {
            host_name: process::host_name().to_string(),
            process_id: process::process_id(),
            entity: EntityId::generate(),
            service_name: service_name.to_string(),
        };
        let shared = Arc::new(ServiceShared {
            id: id.clone(),
            kind: SampleKind::RegisterClient,
            port: 0,
            registration_clock: AtomicU64::new(0),
            parameters: self.config.parameters.clone(),
        });
        self.store
            .register(id.entity, Arc::clone(&shared) as Arc<dyn SampleSource>);

        Ok(ServiceClient {
            id,
            manager: clients,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            sessions: Mutex::new(HashMap::new()),
            pool: self.pool.clone(),
        })
    }

    /// Aggregate view of everything the registry currently knows.
    #[must_use]
    pub fn monitoring(&self) -> MonitoringSnapshot {
        self.registry.monitoring()
    }

    /// The registry backing this node.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Tear the node down: broadcast unregisters, stop the bus and the RPC
    /// loop, drain the pool. One-shot; entity factories fail afterwards.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("[NODE] {} shutting down", self.name);
        if let Some(mut bus) = self.bus.lock().take() {
            bus.stop();
        }
        if let Some(rpc) = self.rpc.lock().take() {
            rpc.io.stop();
        }
        self.pool.shutdown();
        self.pool.join();
    }

    fn ensure_up(&self) -> Result<()> {
        if self.down.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Get or create the RPC plumbing (one event loop, one manager pair
    /// per node generation).
    fn rpc_runtime(&self) -> Result<(Arc<ServerManager>, Arc<ClientManager>)> {
        let mut slot = self.rpc.lock();
        if slot.is_none() {
            let io = IoContext::spawn()
                .map_err(|e| Error::ResourceExhaustion(format!("rpc event loop: {e}")))?;
            *slot = Some(RpcRuntime {
                servers: Arc::new(ServerManager::new(
                    Arc::clone(&io),
                    self.pool.clone(),
                    self.config.rpc.clone(),
                )),
                clients: Arc::new(ClientManager::new(
                    Arc::clone(&io),
                    self.pool.clone(),
                    self.config.rpc.clone(),
                )),
                io,
            });
        }
        let runtime = slot
            .as_ref()
            .unwrap_or_else(|| unreachable!("initialized above"));
        Ok((Arc::clone(&runtime.servers), Arc::clone(&runtime.clients)))
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-state sample source.
struct ProcessSource {
    entity: EntityId,
    unit_name: String,
    parameters: String,
    registration_clock: AtomicU64,
}

impl SampleSource for ProcessSource {
    fn sample(&self) -> Sample {
        Sample {
            kind: SampleKind::ProcessState,
            identifier: SampleIdentifier {
                entity: self.entity,
                process_id: process::process_id(),
            },
            endpoint: None,
            registration_clock: self.registration_clock.load(Ordering::Acquire),
            process: ProcessMeta {
                process_id: process::process_id(),
                host_name: process::host_name().to_string(),
                unit_name: self.unit_name.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// Registration sample source shared by servers and clients.
struct ServiceShared {
    id: ServiceId,
    kind: SampleKind,
    port: u16,
    registration_clock: AtomicU64,
    parameters: String,
}

impl SampleSource for ServiceShared {
    fn sample(&self) -> Sample {
        let layers = if self.port > 0 {
            vec![TransportLayerDescriptor {
                version: 1,
                layer: TransportLayer::Tcp { port: self.port },
            }]
        } else {
            Vec::new()
        };
        Sample {
            kind: self.kind,
            identifier: SampleIdentifier {
                entity: self.id.entity,
                process_id: self.id.process_id,
            },
            endpoint: Some(EndpointBlock {
                name: self.id.service_name.clone(),
                datatype: DataTypeInformation::default(),
                layers,
                counters: EntityCounters {
                    id: self.id.entity.raw(),
                    ..EntityCounters::default()
                },
            }),
            registration_clock: self.registration_clock.load(Ordering::Acquire),
            process: ProcessMeta {
                process_id: self.id.process_id,
                host_name: self.id.host_name.clone(),
                unit_name: self.id.service_name.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// Service server: an RPC server advertised via registration.
pub struct ServiceServer {
    server: crate::rpc::Server,
    id: ServiceId,
    store: Arc<SampleStore>,
}

impl ServiceServer {
    /// Register (or replace) a method handler.
    pub fn add_method<F>(&self, name: &str, handler: F)
    where
        F: Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.server.add_method(name, handler);
    }

    /// Remove a method handler.
    pub fn remove_method(&self, name: &str) {
        self.server.remove_method(name);
    }

    /// Listening port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Connected client sessions.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    /// Install the session lifecycle callback.
    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        self.server.set_event_callback(callback);
    }

    /// Service identity.
    #[must_use]
    pub fn id(&self) -> &ServiceId {
        &self.id
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.store.unregister(self.id.entity);
    }
}

/// Service client: opens sessions to every discovered server instance of
/// one service and issues calls on the first reachable one.
pub struct ServiceClient {
    id: ServiceId,
    manager: Arc<ClientManager>,
    registry: Arc<Registry>,
    store: Arc<SampleStore>,
    sessions: Mutex<HashMap<EntityId, ClientSession>>,
    pool: ThreadPool,
}

impl ServiceClient {
    /// Blocking call on the first reachable server instance.
    #[must_use]
    pub fn call(&self, method: &str, request: &[u8]) -> ServiceResponse {
        self.refresh_sessions();
        let sessions: Vec<ClientSession> =
            self.sessions.lock().values().cloned().collect();
        if sessions.is_empty() {
            return ServiceResponse::failed(format!(
                "no server for service {} reachable",
                self.id.service_name
            ));
        }
        let mut last = ServiceResponse::failed("no session usable");
        for session in sessions {
            if !session.is_connected() {
                continue;
            }
            last = session.call(method, request);
            if last.is_executed() || last.call_state == crate::rpc::CallState::TimedOut {
                return last;
            }
        }
        last
    }

    /// Async variant; the callback runs on the thread pool.
    pub fn call_async<F>(&self, method: &str, request: &[u8], callback: F) -> bool
    where
        F: FnOnce(ServiceResponse) + Send + 'static,
    {
        // The blocking path needs shared state; clone the lookup inputs.
        let sessions: Vec<ClientSession> = {
            self.refresh_sessions();
            self.sessions.lock().values().cloned().collect()
        };
        let method = method.to_string();
        let request = request.to_vec();
        let service_name = self.id.service_name.clone();
        self.pool.post(move || {
            let response = sessions
                .iter()
                .find(|s| s.is_connected())
                .map_or_else(
                    || {
                        ServiceResponse::failed(format!(
                            "no server for service {service_name} reachable"
                        ))
                    },
                    |session| session.call(&method, &request),
                );
            callback(response);
        })
    }

    /// Number of server instances with an open session.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.refresh_sessions();
        self.sessions.lock().len()
    }

    /// Service identity.
    #[must_use]
    pub fn id(&self) -> &ServiceId {
        &self.id
    }

    /// Open sessions to discovered servers, drop dead ones.
    fn refresh_sessions(&self) {
        let servers = self.registry.query_servers();
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| session.is_connected());

        for sample in servers {
            if sample.endpoint_name() != Some(self.id.service_name.as_str()) {
                continue;
            }
            let entity = sample.identifier.entity;
            if sessions.contains_key(&entity) {
                continue;
            }
            let Some(block) = &sample.endpoint else {
                continue;
            };
            let Some(port) = block.layers.iter().find_map(|d| match d.layer {
                TransportLayer::Tcp { port } => Some(port),
                _ => None,
            }) else {
                continue;
            };
            // Same-host servers are reached over loopback; remote ones by
            // their announced host name.
            let host = if sample.is_local_to(&self.id.host_name) {
                "127.0.0.1".to_string()
            } else {
                sample.process.host_name.clone()
            };
            match self.manager.create_session(&host, port) {
                Ok(session) => {
                    log::debug!(
                        "[NODE] service {}: session to {host}:{port}",
                        self.id.service_name
                    );
                    sessions.insert(entity, session);
                }
                Err(e) => {
                    log::debug!(
                        "[NODE] service {}: connect to {host}:{port} failed: {e}",
                        self.id.service_name
                    );
                }
            }
        }
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.store.unregister(self.id.entity);
    }
}
