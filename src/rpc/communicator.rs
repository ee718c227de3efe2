//! Communicator - the entry point to the RPC runtime
//!
//! A communicator owns the runtime properties, the cached client
//! connections and the object adapters. It must be destroyed explicitly
//! with [`Communicator::destroy`]; dropping it only signals tasks to stop.

use std::sync::Arc;

use super::adapter::ObjectAdapter;
use super::endpoint::Endpoint;
use super::instance::Instance;
use super::proxy::ObjectPrx;
use super::reference::Reference;
use crate::common::properties::RESERVED_PREFIXES;
use crate::common::{Error, Properties, Result};

/// Settings supplied when creating a communicator
#[derive(Debug, Clone, Default)]
pub struct InitializationData {
    pub properties: Properties,
}

impl InitializationData {
    pub fn new(properties: Properties) -> Self {
        Self { properties }
    }
}

/// Handle to an initialized RPC runtime
pub struct Communicator {
    instance: Arc<Instance>,
    args: Vec<String>,
}

impl Communicator {
    /// Create a communicator
    ///
    /// Reserved `--Rpc.*` and `--Test.*` options in `args` override the
    /// initialization properties; the rest are available from
    /// [`Communicator::args`]. Fails if any runtime property is invalid.
    pub fn initialize(args: Vec<String>, init_data: InitializationData) -> Result<Self> {
        let mut properties = init_data.properties;
        let mut remaining = args;
        for prefix in RESERVED_PREFIXES {
            remaining = properties.parse_command_line_options(prefix, &remaining);
        }

        let instance = Instance::new(properties)?;
        tracing::debug!(
            message_size_max = instance.settings().message_size_max,
            "Communicator initialized"
        );

        Ok(Self {
            instance,
            args: remaining,
        })
    }

    /// Snapshot of the current properties
    pub fn properties(&self) -> Properties {
        self.instance.properties()
    }

    /// Set a property; runtime settings read at initialization are unaffected
    pub fn set_property(&self, key: &str, value: &str) {
        self.instance.set_property(key, value);
    }

    /// Arguments not consumed as properties
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn is_destroyed(&self) -> bool {
        self.instance.is_destroyed()
    }

    pub fn string_to_proxy(&self, s: &str) -> Result<ObjectPrx> {
        self.instance.check_alive()?;
        let reference = Reference::parse(s, self.instance.defaults())?;
        Ok(ObjectPrx::new(reference, self.instance.clone()))
    }

    pub fn proxy_to_string(&self, proxy: &ObjectPrx) -> String {
        proxy.to_string()
    }

    /// Build a proxy from the property `prefix`
    ///
    /// `<prefix>.Secure` and `<prefix>.Context.<key>` adjust the proxy.
    /// Returns `None` when the property is unset.
    pub fn property_to_proxy(&self, prefix: &str) -> Result<Option<ObjectPrx>> {
        self.instance.check_alive()?;
        let properties = self.instance.properties();
        let Some(value) = properties.get(prefix) else {
            return Ok(None);
        };

        let mut reference = Reference::parse(value, self.instance.defaults())?;
        reference.secure = properties.get_bool_or(&format!("{prefix}.Secure"), reference.secure)?;

        let context_prefix = format!("{prefix}.Context.");
        for (key, value) in properties.get_for_prefix(&context_prefix) {
            if let Some(name) = key.strip_prefix(&context_prefix) {
                reference.context.insert(name.to_string(), value);
            }
        }

        Ok(Some(ObjectPrx::new(reference, self.instance.clone())))
    }

    /// Number of open client connections
    pub async fn connection_count(&self) -> usize {
        self.instance.connection_count().await
    }

    /// Create an adapter listening on `<name>.Endpoints`
    pub fn create_object_adapter(&self, name: &str) -> Result<ObjectAdapter> {
        let key = format!("{name}.Endpoints");
        let endpoints = self
            .instance
            .properties()
            .get(&key)
            .map(str::to_string)
            .ok_or_else(|| Error::Config(format!("property '{key}' is not set")))?;
        self.create_object_adapter_with_endpoints(name, &endpoints)
    }

    /// Create an adapter listening on a `:`-separated endpoint list
    pub fn create_object_adapter_with_endpoints(
        &self,
        name: &str,
        endpoints: &str,
    ) -> Result<ObjectAdapter> {
        self.instance.check_alive()?;
        let endpoints = endpoints
            .split(':')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| Endpoint::parse_with(e, self.instance.defaults()))
            .collect::<Result<Vec<_>>>()?;
        if endpoints.is_empty() {
            return Err(Error::Config(format!("object adapter '{name}' has no endpoints")));
        }

        let adapter = ObjectAdapter::new(
            name,
            Arc::downgrade(&self.instance),
            self.instance.settings().clone(),
            endpoints,
        );
        self.instance.register_adapter(adapter.clone())?;
        Ok(adapter)
    }

    /// Ask [`Communicator::wait_for_shutdown`] callers to return
    pub fn shutdown(&self) {
        self.instance.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.instance.is_shutdown()
    }

    /// Wait until `shutdown` is called locally or by a servant
    pub async fn wait_for_shutdown(&self) {
        self.instance.wait_for_shutdown().await;
    }

    /// Release every resource the communicator holds
    ///
    /// Idempotent. Any operation on the communicator or its proxies fails
    /// with [`Error::CommunicatorDestroyed`] afterwards.
    pub async fn destroy(&self) -> Result<()> {
        self.instance.destroy().await
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if !self.instance.is_destroyed() {
            tracing::warn!("Communicator dropped without being destroyed");
            self.instance.abandon();
        }
    }
}
