//! Object adapters - listeners dispatching requests to servants
//!
//! An adapter owns one listener per configured endpoint. Each accepted
//! connection is served by its own task: the task greets the client,
//! then reads requests and dispatches them one at a time. Deactivation
//! stops the listeners and closes every connection after the request in
//! progress has been answered.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use super::endpoint::Endpoint;
use super::identity::Identity;
use super::instance::Instance;
use super::protocol::{
    Context, Message, OperationMode, ReplyMessage, ReplyStatus, RequestMessage,
    ONEWAY_REQUEST_ID, OP_ID, OP_IDS, OP_IS_A, OP_PING,
};
use super::proxy::ObjectPrx;
use super::reference::Reference;
use super::settings::Settings;
use super::transport::{self, BoxReader, BoxWriter, Listener};
use crate::common::{panic_message, Error, Result};

/// Information about the request being dispatched
pub struct Current {
    pub adapter: ObjectAdapter,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub request_id: u32,
}

/// Why a servant could not complete an operation
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    /// The servant does not implement the operation
    OperationNotExist,
    /// An exception declared by the interface
    User(Value),
    /// Anything else; the message is sent to the client
    Unknown(String),
}

pub type DispatchResult = std::result::Result<Value, DispatchError>;

/// Server-side implementation of an interface
///
/// The built-in operations (`rpc_ping`, `rpc_isA`, `rpc_id`, `rpc_ids`) are
/// answered by the adapter from [`Servant::type_id`] and
/// [`Servant::type_ids`]; everything else reaches [`Servant::dispatch`].
#[async_trait]
pub trait Servant: Send + Sync {
    /// Most-derived type id
    fn type_id(&self) -> String;

    /// Every type id the servant implements, including the most-derived
    /// one and `::Rpc::Object`
    fn type_ids(&self) -> Vec<String>;

    /// Dispatch an application operation
    async fn dispatch(&self, current: &Current, params: Value) -> DispatchResult;
}

enum AdapterState {
    Holding,
    Active {
        published: Vec<Endpoint>,
        accept_tasks: Vec<JoinHandle<()>>,
    },
    Deactivated,
}

type ServantMap = HashMap<Identity, HashMap<String, Arc<dyn Servant>>>;

struct AdapterInner {
    name: String,
    instance: Weak<Instance>,
    settings: Arc<Settings>,
    endpoints: Vec<Endpoint>,
    servants: RwLock<ServantMap>,
    state: Mutex<AdapterState>,
    close_tx: watch::Sender<bool>,
}

/// Handle to an object adapter
#[derive(Clone)]
pub struct ObjectAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for ObjectAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectAdapter")
            .field("name", &self.inner.name)
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

impl ObjectAdapter {
    pub(crate) fn new(
        name: &str,
        instance: Weak<Instance>,
        settings: Arc<Settings>,
        endpoints: Vec<Endpoint>,
    ) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(AdapterInner {
                name: name.to_string(),
                instance,
                settings,
                endpoints,
                servants: RwLock::new(HashMap::new()),
                state: Mutex::new(AdapterState::Holding),
                close_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AdapterState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_not_deactivated(&self) -> Result<()> {
        if matches!(*self.state(), AdapterState::Deactivated) {
            return Err(Error::AdapterDeactivated(self.inner.name.clone()));
        }
        Ok(())
    }

    /// Register a servant under an identity and return a proxy for it
    pub fn add(&self, servant: Arc<dyn Servant>, identity: Identity) -> Result<ObjectPrx> {
        self.add_facet(servant, identity, "")
    }

    /// Register a servant for a facet of an identity
    pub fn add_facet(
        &self,
        servant: Arc<dyn Servant>,
        identity: Identity,
        facet: &str,
    ) -> Result<ObjectPrx> {
        self.check_not_deactivated()?;
        {
            let mut servants = self.inner.servants.write().unwrap_or_else(|e| e.into_inner());
            let facets = servants.entry(identity.clone()).or_default();
            if facets.contains_key(facet) {
                let mut what = identity.to_string();
                if !facet.is_empty() {
                    what.push_str(&format!(" -f {facet}"));
                }
                return Err(Error::AlreadyRegistered(what));
            }
            facets.insert(facet.to_string(), servant);
        }
        Ok(self.create_proxy(identity)?.with_facet(facet))
    }

    /// Unregister the default facet of an identity
    pub fn remove(&self, identity: &Identity) -> Option<Arc<dyn Servant>> {
        self.remove_facet(identity, "")
    }

    /// Unregister one facet of an identity
    pub fn remove_facet(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let mut servants = self.inner.servants.write().unwrap_or_else(|e| e.into_inner());
        let facets = servants.get_mut(identity)?;
        let removed = facets.remove(facet);
        if facets.is_empty() {
            servants.remove(identity);
        }
        removed
    }

    /// Look up the servant registered for an identity and facet
    pub fn find(&self, identity: &Identity, facet: &str) -> Option<Arc<dyn Servant>> {
        let servants = self.inner.servants.read().unwrap_or_else(|e| e.into_inner());
        servants.get(identity)?.get(facet).cloned()
    }

    fn has_identity(&self, identity: &Identity) -> bool {
        let servants = self.inner.servants.read().unwrap_or_else(|e| e.into_inner());
        servants.contains_key(identity)
    }

    /// Proxy for an identity at this adapter's endpoints
    pub fn create_proxy(&self, identity: Identity) -> Result<ObjectPrx> {
        let instance = self
            .inner
            .instance
            .upgrade()
            .ok_or(Error::CommunicatorDestroyed)?;
        Ok(ObjectPrx::new(
            Reference::new(identity, self.endpoints()),
            instance,
        ))
    }

    /// Published endpoints once active, configured endpoints otherwise
    pub fn endpoints(&self) -> Vec<Endpoint> {
        match &*self.state() {
            AdapterState::Active { published, .. } => published.clone(),
            _ => self.inner.endpoints.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.state(), AdapterState::Active { .. })
    }

    pub fn is_deactivated(&self) -> bool {
        matches!(*self.state(), AdapterState::Deactivated)
    }

    /// Start listening on every configured endpoint
    pub async fn activate(&self) -> Result<()> {
        if self.is_active() {
            return Ok(());
        }
        self.check_not_deactivated()?;

        let mut listeners = Vec::with_capacity(self.inner.endpoints.len());
        for endpoint in &self.inner.endpoints {
            let (listener, published) =
                Listener::bind(endpoint)
                    .await
                    .map_err(|source| Error::BindFailed {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
            listeners.push((listener, published));
        }

        let mut published = Vec::with_capacity(listeners.len());
        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, endpoint) in listeners {
            tracing::info!(adapter = %self.inner.name, endpoint = %endpoint, "Adapter listening");
            accept_tasks.push(self.spawn_accept_loop(listener, endpoint.clone()));
            published.push(endpoint);
        }

        *self.state() = AdapterState::Active {
            published,
            accept_tasks,
        };
        Ok(())
    }

    fn spawn_accept_loop(&self, listener: Listener, endpoint: Endpoint) -> JoinHandle<()> {
        let adapter = self.clone();
        let mut close_rx = self.inner.close_tx.subscribe();

        tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = wait_closed(&mut close_rx) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((reader, writer, peer)) => {
                            connections
                                .spawn(adapter.clone().serve_connection(reader, writer, peer));
                        }
                        Err(e) => {
                            tracing::error!(endpoint = %endpoint, "Accept error: {}", e);
                        }
                    }
                }
            }

            if let Err(e) = listener.close() {
                tracing::warn!(endpoint = %endpoint, "Failed to close listener: {}", e);
            }
            while connections.join_next().await.is_some() {}
        })
    }

    /// Serve one accepted connection until it closes or the adapter deactivates
    async fn serve_connection(self, mut reader: BoxReader, mut writer: BoxWriter, peer: String) {
        let max = self.inner.settings.message_size_max;
        if self.inner.settings.trace_network > 0 {
            tracing::info!(adapter = %self.inner.name, peer = %peer, "Accepted connection");
        } else {
            tracing::debug!(adapter = %self.inner.name, peer = %peer, "Accepted connection");
        }

        if let Err(e) =
            transport::write_frame(&mut writer, &Message::ValidateConnection, max).await
        {
            tracing::warn!(peer = %peer, "Failed to validate connection: {}", e);
            return;
        }

        let mut close_rx = self.inner.close_tx.subscribe();
        loop {
            let frame = tokio::select! {
                biased;
                _ = wait_closed(&mut close_rx) => {
                    let _ =
                        transport::write_frame(&mut writer, &Message::CloseConnection, max).await;
                    let _ = writer.shutdown().await;
                    break;
                }
                frame = transport::read_frame(&mut reader, max) => frame,
            };

            match frame {
                Ok(Message::Request(request)) => {
                    let twoway = request.request_id != ONEWAY_REQUEST_ID;
                    let reply = self.dispatch(request).await;
                    if twoway {
                        if let Err(e) =
                            transport::write_frame(&mut writer, &Message::Reply(reply), max).await
                        {
                            tracing::warn!(peer = %peer, "Failed to send reply: {}", e);
                            break;
                        }
                    }
                }
                Ok(Message::CloseConnection) => {
                    tracing::debug!(peer = %peer, "Client closed connection");
                    break;
                }
                Ok(other) => {
                    tracing::warn!(peer = %peer, "Unexpected message {:?}, closing", other);
                    break;
                }
                Err(Error::Io(e)) if transport::is_peer_gone(&e) => {
                    tracing::debug!(peer = %peer, "Client disconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, "Error reading request: {}", e);
                    break;
                }
            }
        }
    }

    /// Dispatch a request to the registered servant
    pub(crate) async fn dispatch(&self, request: RequestMessage) -> ReplyMessage {
        let Some(servant) = self.find(&request.identity, &request.facet) else {
            let status = if self.has_identity(&request.identity) {
                ReplyStatus::FacetNotExist
            } else {
                ReplyStatus::ObjectNotExist
            };
            return ReplyMessage::failure(&request, status, ReplyMessage::not_exist_body(&request));
        };

        if self.inner.settings.trace_protocol > 0 {
            tracing::info!(
                adapter = %self.inner.name,
                identity = %request.identity,
                operation = %request.operation,
                "Dispatching request"
            );
        }

        let result = match request.operation.as_str() {
            OP_PING => Ok(Value::Null),
            OP_IS_A => match request.params.get("type_id").and_then(Value::as_str) {
                Some(type_id) => Ok(json!(servant.type_ids().iter().any(|id| id == type_id))),
                None => Err(DispatchError::Unknown(format!(
                    "{OP_IS_A} requires a 'type_id' parameter"
                ))),
            },
            OP_ID => Ok(json!(servant.type_id())),
            OP_IDS => {
                let mut ids = servant.type_ids();
                ids.sort();
                Ok(json!(ids))
            }
            _ => {
                let current = Current {
                    adapter: self.clone(),
                    identity: request.identity.clone(),
                    facet: request.facet.clone(),
                    operation: request.operation.clone(),
                    mode: request.mode,
                    context: request.context.clone(),
                    request_id: request.request_id,
                };
                AssertUnwindSafe(servant.dispatch(&current, request.params.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(
                            operation = %request.operation,
                            "Servant panicked: {}",
                            message
                        );
                        Err(DispatchError::Unknown(format!("servant panicked: {message}")))
                    })
            }
        };

        match result {
            Ok(body) => ReplyMessage::ok(request.request_id, body),
            Err(DispatchError::OperationNotExist) => ReplyMessage::failure(
                &request,
                ReplyStatus::OperationNotExist,
                ReplyMessage::not_exist_body(&request),
            ),
            Err(DispatchError::User(body)) => {
                ReplyMessage::failure(&request, ReplyStatus::UserException, body)
            }
            Err(DispatchError::Unknown(message)) => {
                ReplyMessage::failure(&request, ReplyStatus::UnknownException, json!(message))
            }
        }
    }

    /// Whether a proxy with these endpoints would reach this adapter
    pub(crate) fn serves(&self, endpoints: &[Endpoint]) -> bool {
        match &*self.state() {
            AdapterState::Active { published, .. } => endpoints
                .iter()
                .any(|ep| published.iter().any(|p| p.same_address(ep))),
            _ => false,
        }
    }

    /// Ask the owning communicator to shut down
    pub fn shutdown_communicator(&self) {
        if let Some(instance) = self.inner.instance.upgrade() {
            instance.shutdown();
        }
    }

    /// Stop listening and close all connections
    ///
    /// Waits until every connection task has finished, so replies to
    /// requests already being dispatched are written first.
    pub async fn deactivate(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state(), AdapterState::Deactivated);
        self.inner.close_tx.send_replace(true);

        if let AdapterState::Active { accept_tasks, .. } = previous {
            for task in accept_tasks {
                task.await
                    .map_err(|e| Error::Internal(format!("adapter task failed: {e}")))?;
            }
            tracing::info!(adapter = %self.inner.name, "Adapter deactivated");
        }
        Ok(())
    }

    /// Signal tasks to stop without waiting for them
    pub(crate) fn abandon(&self) {
        *self.state() = AdapterState::Deactivated;
        self.inner.close_tx.send_replace(true);
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Properties;
    use crate::rpc::communicator::{Communicator, InitializationData};

    struct Hello;

    #[async_trait]
    impl Servant for Hello {
        fn type_id(&self) -> String {
            "::Demo::Hello".to_string()
        }

        fn type_ids(&self) -> Vec<String> {
            vec!["::Demo::Hello".to_string(), "::Rpc::Object".to_string()]
        }

        async fn dispatch(&self, current: &Current, params: Value) -> DispatchResult {
            match current.operation.as_str() {
                "sayHello" => Ok(json!(format!("hello {}", params["name"].as_str().unwrap_or("")))),
                "fail" => Err(DispatchError::User(json!({"reason": "requested"}))),
                "panic" => panic!("boom"),
                _ => Err(DispatchError::OperationNotExist),
            }
        }
    }

    fn communicator() -> Communicator {
        Communicator::initialize(Vec::new(), InitializationData::new(Properties::new())).unwrap()
    }

    fn request(identity: &str, facet: &str, operation: &str, params: Value) -> RequestMessage {
        RequestMessage {
            request_id: 1,
            identity: Identity::parse(identity).unwrap(),
            facet: facet.to_string(),
            operation: operation.to_string(),
            mode: OperationMode::Normal,
            context: Context::new(),
            params,
        }
    }

    #[tokio::test]
    async fn test_dispatch_statuses() {
        let communicator = communicator();
        let adapter = communicator
            .create_object_adapter_with_endpoints("Demo", "tcp -h 127.0.0.1 -p 0")
            .unwrap();
        adapter.add(Arc::new(Hello), Identity::new("hello")).unwrap();

        let reply = adapter
            .dispatch(request("hello", "", "sayHello", json!({"name": "world"})))
            .await;
        assert_eq!(reply.body, json!("hello world"));

        let reply = adapter.dispatch(request("missing", "", OP_PING, Value::Null)).await;
        assert_eq!(reply.status, ReplyStatus::ObjectNotExist);

        let reply = adapter.dispatch(request("hello", "f", OP_PING, Value::Null)).await;
        assert_eq!(reply.status, ReplyStatus::FacetNotExist);

        let reply = adapter.dispatch(request("hello", "", "nope", Value::Null)).await;
        assert_eq!(reply.status, ReplyStatus::OperationNotExist);

        let reply = adapter.dispatch(request("hello", "", "fail", Value::Null)).await;
        assert_eq!(reply.status, ReplyStatus::UserException);

        let reply = adapter.dispatch(request("hello", "", "panic", Value::Null)).await;
        assert_eq!(reply.status, ReplyStatus::UnknownException);

        let reply = adapter
            .dispatch(request("hello", "", OP_IS_A, json!({"type_id": "::Rpc::Object"})))
            .await;
        assert_eq!(reply.body, json!(true));

        let reply = adapter.dispatch(request("hello", "", OP_IDS, Value::Null)).await;
        assert_eq!(reply.body, json!(["::Demo::Hello", "::Rpc::Object"]));

        communicator.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_registration() {
        let communicator = communicator();
        let adapter = communicator
            .create_object_adapter_with_endpoints("Demo", "tcp -h 127.0.0.1 -p 0")
            .unwrap();
        let id = Identity::new("hello");

        let proxy = adapter.add_facet(Arc::new(Hello), id.clone(), "extra").unwrap();
        assert_eq!(proxy.facet(), "extra");
        assert!(adapter.add_facet(Arc::new(Hello), id.clone(), "extra").is_err());
        assert!(adapter.find(&id, "extra").is_some());
        assert!(adapter.remove(&id).is_none());
        assert!(adapter.remove_facet(&id, "extra").is_some());
        assert!(adapter.find(&id, "extra").is_none());

        communicator.destroy().await.unwrap();
        assert!(adapter.is_deactivated());
        assert!(matches!(
            adapter.add(Arc::new(Hello), id),
            Err(Error::AdapterDeactivated(_))
        ));
    }

    #[tokio::test]
    async fn test_activate_publishes_ephemeral_port() {
        let communicator = communicator();
        let adapter = communicator
            .create_object_adapter_with_endpoints("Demo", "tcp -h 127.0.0.1 -p 0")
            .unwrap();
        adapter.activate().await.unwrap();
        assert!(adapter.is_active());
        match &adapter.endpoints()[0] {
            Endpoint::Tcp { port, .. } => assert_ne!(*port, 0),
            other => panic!("Expected tcp endpoint, got {other}"),
        }
        adapter.deactivate().await.unwrap();
        assert!(adapter.activate().await.is_err());
        communicator.destroy().await.unwrap();
    }
}
