//! Shared runtime state behind a communicator and its proxies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::watch;

use super::adapter::ObjectAdapter;
use super::connection::Connection;
use super::endpoint::{Endpoint, EndpointDefaults};
use super::protocol::{Context, OperationMode, RequestMessage, ONEWAY_REQUEST_ID};
use super::reference::{InvocationMode, Reference};
use super::settings::Settings;
use crate::common::{Error, Properties, Result};

pub(crate) struct Instance {
    properties: RwLock<Properties>,
    settings: Arc<Settings>,
    defaults: EndpointDefaults,
    destroyed: AtomicBool,
    connections: tokio::sync::Mutex<Vec<Arc<Connection>>>,
    adapters: Mutex<Vec<ObjectAdapter>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Instance {
    /// Validate the runtime properties and build the instance
    pub(crate) fn new(properties: Properties) -> Result<Arc<Self>> {
        let settings = Settings::from_properties(&properties)?;
        let defaults = EndpointDefaults::from_properties(&properties)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            properties: RwLock::new(properties),
            settings: Arc::new(settings),
            defaults,
            destroyed: AtomicBool::new(false),
            connections: tokio::sync::Mutex::new(Vec::new()),
            adapters: Mutex::new(Vec::new()),
            shutdown_tx,
        }))
    }

    pub(crate) fn properties(&self) -> Properties {
        self.properties.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set_property(&self, key: &str, value: &str) {
        self.properties
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set(key, value);
    }

    pub(crate) fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub(crate) fn defaults(&self) -> &EndpointDefaults {
        &self.defaults
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::CommunicatorDestroyed);
        }
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::debug!("Communicator shutdown requested");
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }

    pub(crate) fn register_adapter(&self, adapter: ObjectAdapter) -> Result<()> {
        self.check_alive()?;
        let mut adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        if adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(Error::AdapterAlreadyExists(adapter.name().to_string()));
        }
        adapters.push(adapter);
        Ok(())
    }

    fn find_collocated(&self, endpoints: &[Endpoint]) -> Option<ObjectAdapter> {
        let adapters = self.adapters.lock().unwrap_or_else(|e| e.into_inner());
        adapters.iter().find(|a| a.serves(endpoints)).cloned()
    }

    pub(crate) async fn connection_count(&self) -> usize {
        let connections = self.connections.lock().await;
        connections.iter().filter(|c| !c.is_closed()).count()
    }

    /// Cached connection to the first reachable endpoint
    async fn connection_for(&self, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().await;
        connections.retain(|c| !c.is_closed());

        for endpoint in endpoints {
            if let Some(existing) = connections
                .iter()
                .find(|c| c.endpoint().same_address(endpoint))
            {
                return Ok(existing.clone());
            }
        }

        let mut last_error = None;
        for endpoint in endpoints {
            match Connection::connect(endpoint, self.settings.clone()).await {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    connections.push(connection.clone());
                    return Ok(connection);
                }
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, "Connection attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no endpoints to connect to".to_string())))
    }

    async fn evict(&self, connection: &Arc<Connection>) {
        let mut connections = self.connections.lock().await;
        connections.retain(|c| !Arc::ptr_eq(c, connection));
    }

    /// Send a request through a reference
    ///
    /// Returns `Ok(None)` for oneway requests. A request that never reached
    /// the wire is retried once on a fresh connection, as is an idempotent
    /// request whose connection was lost.
    pub(crate) async fn invoke(
        &self,
        reference: &Reference,
        operation: &str,
        mode: OperationMode,
        params: Value,
        context: Option<&Context>,
    ) -> Result<Option<Value>> {
        self.check_alive()?;
        if reference.endpoints.is_empty() {
            return Err(Error::NoEndpoint(reference.to_string()));
        }

        let twoway = reference.mode == InvocationMode::Twoway;
        let request = RequestMessage {
            request_id: ONEWAY_REQUEST_ID,
            identity: reference.identity.clone(),
            facet: reference.facet.clone(),
            operation: operation.to_string(),
            mode,
            context: context.unwrap_or(&reference.context).clone(),
            params,
        };

        if let Some(adapter) = self.find_collocated(&reference.endpoints) {
            let reply = adapter
                .dispatch(RequestMessage {
                    request_id: if twoway { 1 } else { ONEWAY_REQUEST_ID },
                    ..request
                })
                .await;
            return if twoway {
                reply.into_result().map(Some)
            } else {
                Ok(None)
            };
        }

        let mut retried = false;
        loop {
            let connection = self.connection_for(&reference.endpoints).await?;
            let timeout = self
                .settings
                .override_timeout
                .or(connection.endpoint().timeout());

            match connection.send_request(request.clone(), twoway, timeout).await {
                Ok(Some(reply)) => return reply.into_result().map(Some),
                Ok(None) => return Ok(None),
                Err(failure) => {
                    let lost = matches!(
                        failure.error,
                        Error::ConnectionLost(_) | Error::ConnectionClosed(_)
                    );
                    if lost || connection.is_closed() {
                        self.evict(&connection).await;
                    }

                    let retryable = lost && (!failure.sent || mode == OperationMode::Idempotent);
                    if retryable && !retried {
                        retried = true;
                        tracing::debug!(
                            operation = %operation,
                            "Retrying request after: {}",
                            failure.error
                        );
                        continue;
                    }
                    return Err(failure.error);
                }
            }
        }
    }

    /// Deactivate adapters and close connections
    ///
    /// Only the first call does any work. Every step runs even if an earlier
    /// one failed; the first error is returned.
    pub(crate) async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown();

        let mut first_error = None;

        let adapters =
            std::mem::take(&mut *self.adapters.lock().unwrap_or_else(|e| e.into_inner()));
        for adapter in adapters {
            if let Err(e) = adapter.deactivate().await {
                tracing::warn!(adapter = %adapter.name(), "Failed to deactivate adapter: {}", e);
                first_error.get_or_insert(e);
            }
        }

        let connections = std::mem::take(&mut *self.connections.lock().await);
        for connection in connections {
            if let Err(e) = connection.close().await {
                tracing::warn!(
                    endpoint = %connection.endpoint(),
                    "Failed to close connection: {}",
                    e
                );
                first_error.get_or_insert(e);
            }
        }

        tracing::debug!("Communicator destroyed");
        first_error.map_or(Ok(()), Err)
    }

    /// Best-effort synchronous teardown for a communicator dropped without
    /// `destroy`
    pub(crate) fn abandon(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown();
        let adapters =
            std::mem::take(&mut *self.adapters.lock().unwrap_or_else(|e| e.into_inner()));
        for adapter in adapters {
            adapter.abandon();
        }
        if let Ok(mut connections) = self.connections.try_lock() {
            connections.clear();
        }
    }
}
