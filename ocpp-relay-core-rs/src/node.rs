//! Networking node facade
//!
//! A node is built once with [`NodeBuilder`]: registry, handlers, voters and
//! observers are fixed at build time, the transport is injected. Transports
//! then report connections and push inbound frames; applications call
//! [`NetworkingNode::send`].

use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapter::{NodeCore, SendRequest, TransitTable};
use crate::codec::Frame;
use crate::config::{ConfigError, NodeConfig};
use crate::correlation::Correlator;
use crate::forwarding::{ForwardingPipeline, ForwardingVoter, VoterHandle};
use crate::handler::{HandlerError, HandlerTable, RequestContext};
use crate::messages::Payload;
use crate::registry::{ActionRegistry, BinaryPayload};
use crate::result::{ExchangeResult, Response};
use crate::routing::{ConnectionInfo, RoutingTable};
use crate::telemetry::{ExchangeObserver, Telemetry, TelemetrySink, TracingSink};
use crate::transport::Transport;
use crate::types::{ConnectionId, NodeId};

type DeferredHandler = Box<dyn FnOnce(&mut HandlerTable, &Arc<ActionRegistry>) + Send>;

/// Builder for a [`NetworkingNode`]
pub struct NodeBuilder {
    config: NodeConfig,
    registry: ActionRegistry,
    handlers: HandlerTable,
    typed_handlers: Vec<DeferredHandler>,
    voters: Vec<Arc<dyn ForwardingVoter>>,
    observers: Vec<Arc<dyn ExchangeObserver>>,
    sink: Arc<dyn TelemetrySink>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            registry: ActionRegistry::new(),
            handlers: HandlerTable::new(),
            typed_handlers: Vec::new(),
            voters: Vec::new(),
            observers: Vec::new(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Replace the action registry
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Mutable access to the registry being built
    pub fn registry_mut(&mut self) -> &mut ActionRegistry {
        &mut self.registry
    }

    pub fn register_json<Req, Resp>(mut self, action: impl Into<String>) -> Self
    where
        Req: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
        Resp: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register_json::<Req, Resp>(action);
        self
    }

    pub fn register_binary<Req, Resp>(mut self, action: impl Into<String>) -> Self
    where
        Req: BinaryPayload,
        Resp: Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register_binary::<Req, Resp>(action);
        self
    }

    /// Handle `action` locally with a raw payload handler
    pub fn handler<F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(RequestContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, HandlerError>> + Send + 'static,
    {
        self.handlers.register(action, handler);
        self
    }

    /// Handle `action` locally with typed values; the codec comes from the
    /// registry as it stands when the node is built
    pub fn typed_handler<Req, Resp, F, Fut>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        Req: Send + Sync + 'static,
        Resp: Send + Sync + 'static,
        F: Fn(RequestContext, Arc<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let action = action.into();
        self.typed_handlers.push(Box::new(move |table: &mut HandlerTable, registry: &Arc<ActionRegistry>| {
            table.register_typed::<Req, Resp, F, Fut>(registry.clone(), action, handler);
        }));
        self
    }

    /// Use a prepared handler table, replacing handlers added so far
    pub fn with_handlers(mut self, table: HandlerTable) -> Self {
        self.handlers = table;
        self
    }

    pub fn voter(mut self, voter: Arc<dyn ForwardingVoter>) -> Self {
        self.voters.push(voter);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ExchangeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self, transport: Arc<dyn Transport>) -> Result<NetworkingNode, ConfigError> {
        self.config.validate()?;

        let registry = Arc::new(self.registry);
        let mut handlers = self.handlers;
        for deferred in self.typed_handlers {
            deferred(&mut handlers, &registry);
        }

        let telemetry = Telemetry::new(self.sink, self.observers);
        let pipeline = ForwardingPipeline::new(&self.config, registry.clone(), telemetry.clone());
        for voter in self.voters {
            pipeline.register(voter);
        }

        let routing = RoutingTable::new(self.config.node_id.clone(), self.config.is_csms);
        for (destination, via) in &self.config.static_routes {
            routing.add_static_route(destination.clone(), via.clone());
        }

        let transit = TransitTable::new(self.config.request_timeout * 2);

        info!(
            "Node {} ready: {} actions, {} handlers, {} voters, default forwarding {}",
            self.config.node_id,
            registry.len(),
            handlers.actions().count(),
            pipeline.voter_count(),
            self.config.default_forwarding
        );

        Ok(NetworkingNode {
            core: Arc::new(NodeCore {
                config: self.config,
                routing,
                correlator: Correlator::new(),
                pipeline,
                handlers,
                registry,
                telemetry,
                transport,
                transit,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

/// A node that can originate, terminate and relay OCPP messages
#[derive(Clone)]
pub struct NetworkingNode {
    core: Arc<NodeCore>,
}

impl NetworkingNode {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn id(&self) -> &NodeId {
        &self.core.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.core.config
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.core.registry
    }

    /// Feed one inbound frame; returns once it is fully handled
    pub async fn handle_frame(&self, connection: &ConnectionId, frame: Frame) {
        self.core.handle_frame(connection, frame).await
    }

    /// A transport connection is up
    pub fn connection_opened(&self, info: ConnectionInfo) {
        self.core.routing.open(info);
    }

    /// A transport connection is gone: fail its pending requests, drop its routes
    pub fn connection_closed(&self, connection: &ConnectionId) {
        if self.core.routing.close(connection).is_none() {
            return;
        }
        self.core.correlator.fail_connection(connection);
        self.core.transit.forget_connection(connection);
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.routing.connections()
    }

    /// Connection a message for `destination` would leave on
    pub fn route_to(&self, destination: &NodeId) -> Option<ConnectionInfo> {
        self.core.routing.next_hop(destination)
    }

    /// Send a request and wait for its outcome
    pub async fn send(&self, request: SendRequest) -> Response {
        self.core.send_request(request).await
    }

    /// Send a typed request using the registry's codec for `action`
    pub async fn call<Req, Resp>(
        &self,
        action: &str,
        request: &Req,
        destination: Option<NodeId>,
    ) -> Result<Resp, ExchangeResult>
    where
        Req: Any + Send + Sync,
        Resp: Any,
    {
        let payload = self
            .core
            .registry
            .serialize_request(action, request)
            .map_err(|e| ExchangeResult::generic_error(e.to_string()))?;

        let mut send = SendRequest::new(action, payload);
        send.destination = destination;

        let response = self.send(send).await;
        if !response.is_ok() {
            return Err(response.result);
        }

        let payload = response
            .payload
            .ok_or_else(|| ExchangeResult::formation_violation("Response carries no payload"))?;
        self.core
            .registry
            .parse_response::<Resp>(action, &payload)
            .map_err(|e| ExchangeResult::formation_violation(e.to_string()))
    }

    pub fn register_voter(&self, voter: Arc<dyn ForwardingVoter>) -> VoterHandle {
        self.core.pipeline.register(voter)
    }

    pub fn deregister_voter(&self, handle: VoterHandle) -> bool {
        self.core.pipeline.deregister(handle)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.core.correlator.outstanding()
    }

    /// Periodically sweep expired pending requests and transit entries
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let core = Arc::downgrade(&self.core);
        let interval = self.core.config.sweep_interval;
        let shutdown = self.core.shutdown.clone();
        tokio::spawn(maintenance_loop(core, interval, shutdown))
    }

    /// Stop maintenance and cancel running votes
    pub fn shutdown(&self) {
        info!("Node {} shutting down", self.id());
        self.core.shutdown.cancel();
        self.core.pipeline.shutdown();
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeCore> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn from_core(core: Arc<NodeCore>) -> Self {
        Self { core }
    }
}

async fn maintenance_loop(core: Weak<NodeCore>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let Some(core) = core.upgrade() else {
            break;
        };
        let expired = core.correlator.sweep_expired();
        let stale = core.transit.sweep();
        if expired > 0 || stale > 0 {
            debug!("Maintenance: {} expired requests, {} stale transit entries", expired, stale);
        }
    }
}

impl std::fmt::Debug for NetworkingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkingNode")
            .field("id", self.id())
            .field("outstanding", &self.outstanding_requests())
            .finish()
    }
}
