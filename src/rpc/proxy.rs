//! Client-side proxies
//!
//! A proxy pairs a [`Reference`] with the runtime that sends its requests.
//! Proxies are immutable: every builder returns a new proxy. Comparison and
//! hashing look only at the reference.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{json, Value};

use super::endpoint::Endpoint;
use super::identity::Identity;
use super::instance::Instance;
use super::protocol::{Context, OperationMode, OP_ID, OP_IDS, OP_IS_A, OP_PING};
use super::reference::{InvocationMode, Reference};
use crate::common::{Error, Result};

/// Untyped proxy to a remote object
#[derive(Clone)]
pub struct ObjectPrx {
    reference: Reference,
    instance: Arc<Instance>,
}

impl ObjectPrx {
    pub(crate) fn new(reference: Reference, instance: Arc<Instance>) -> Self {
        Self {
            reference,
            instance,
        }
    }

    fn with_reference(&self, reference: Reference) -> Self {
        Self::new(reference, self.instance.clone())
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn identity(&self) -> &Identity {
        &self.reference.identity
    }

    pub fn facet(&self) -> &str {
        &self.reference.facet
    }

    pub fn context(&self) -> &Context {
        &self.reference.context
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.reference.endpoints
    }

    pub fn adapter_id(&self) -> &str {
        &self.reference.adapter_id
    }

    pub fn is_twoway(&self) -> bool {
        self.reference.mode == InvocationMode::Twoway
    }

    pub fn is_oneway(&self) -> bool {
        self.reference.mode == InvocationMode::Oneway
    }

    pub fn is_secure(&self) -> bool {
        self.reference.secure
    }

    pub fn with_identity(&self, identity: Identity) -> Self {
        self.with_reference(Reference {
            identity,
            ..self.reference.clone()
        })
    }

    pub fn with_facet(&self, facet: &str) -> Self {
        self.with_reference(Reference {
            facet: facet.to_string(),
            ..self.reference.clone()
        })
    }

    /// Proxy that sends `context` with every request
    pub fn with_context(&self, context: Context) -> Self {
        self.with_reference(Reference {
            context,
            ..self.reference.clone()
        })
    }

    pub fn twoway(&self) -> Self {
        self.with_reference(Reference {
            mode: InvocationMode::Twoway,
            ..self.reference.clone()
        })
    }

    pub fn oneway(&self) -> Self {
        self.with_reference(Reference {
            mode: InvocationMode::Oneway,
            ..self.reference.clone()
        })
    }

    pub fn with_secure(&self, secure: bool) -> Self {
        self.with_reference(Reference {
            secure,
            ..self.reference.clone()
        })
    }

    /// Apply a timeout in milliseconds to every endpoint, `None` for no timeout
    pub fn with_timeout(&self, timeout: Option<u64>) -> Self {
        self.with_reference(Reference {
            endpoints: self
                .reference
                .endpoints
                .iter()
                .map(|e| e.with_timeout(timeout))
                .collect(),
            ..self.reference.clone()
        })
    }

    /// Direct proxy with the given endpoints
    pub fn with_endpoints(&self, endpoints: Vec<Endpoint>) -> Self {
        self.with_reference(Reference {
            endpoints,
            adapter_id: String::new(),
            ..self.reference.clone()
        })
    }

    /// Indirect proxy naming an adapter
    pub fn with_adapter_id(&self, adapter_id: &str) -> Self {
        self.with_reference(Reference {
            endpoints: Vec::new(),
            adapter_id: adapter_id.to_string(),
            ..self.reference.clone()
        })
    }

    /// Parse a stringified proxy bound to the same communicator
    pub fn sibling(&self, s: &str) -> Result<ObjectPrx> {
        self.instance.check_alive()?;
        let reference = Reference::parse(s, self.instance.defaults())?;
        Ok(self.with_reference(reference))
    }

    fn require_twoway(&self, operation: &str) -> Result<()> {
        if self.is_oneway() {
            return Err(Error::TwowayOnly(operation.to_string()));
        }
        Ok(())
    }

    async fn call(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Value,
        context: Option<&Context>,
    ) -> Result<Value> {
        let reply = self
            .instance
            .invoke(&self.reference, operation, mode, params, context)
            .await?;
        Ok(reply.unwrap_or(Value::Null))
    }

    /// Check that the object exists; oneway proxies only send the request
    pub async fn ping(&self) -> Result<()> {
        self.call(OP_PING, OperationMode::Idempotent, Value::Null, None)
            .await
            .map(|_| ())
    }

    /// Whether the object implements `type_id`
    pub async fn is_a(&self, type_id: &str) -> Result<bool> {
        self.is_a_with_context(type_id, None).await
    }

    pub async fn is_a_with_context(
        &self,
        type_id: &str,
        context: Option<&Context>,
    ) -> Result<bool> {
        self.require_twoway(OP_IS_A)?;
        let reply = self
            .call(OP_IS_A, OperationMode::Idempotent, json!({ "type_id": type_id }), context)
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Most-derived type id of the object
    pub async fn type_id(&self) -> Result<String> {
        self.require_twoway(OP_ID)?;
        let reply = self.call(OP_ID, OperationMode::Idempotent, Value::Null, None).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Every type id the object implements, sorted
    pub async fn type_ids(&self) -> Result<Vec<String>> {
        self.require_twoway(OP_IDS)?;
        let reply = self.call(OP_IDS, OperationMode::Idempotent, Value::Null, None).await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Invoke an application operation
    ///
    /// Returns `Value::Null` immediately for oneway proxies.
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Value,
    ) -> Result<Value> {
        self.call(operation, mode, params, None).await
    }

    /// Invoke with an explicit context that replaces the proxy's own
    pub async fn invoke_with_context(
        &self,
        operation: &str,
        mode: OperationMode,
        params: Value,
        context: &Context,
    ) -> Result<Value> {
        self.call(operation, mode, params, Some(context)).await
    }

    /// This proxy if the object implements `type_id`, `None` otherwise
    pub async fn checked_cast(&self, type_id: &str) -> Result<Option<ObjectPrx>> {
        self.checked_cast_with_context(type_id, None).await
    }

    pub async fn checked_cast_with_context(
        &self,
        type_id: &str,
        context: Option<&Context>,
    ) -> Result<Option<ObjectPrx>> {
        let target = self.twoway();
        match target.is_a_with_context(type_id, context).await {
            Ok(true) => Ok(Some(self.clone())),
            Ok(false) => Ok(None),
            Err(Error::FacetNotExist { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Proxy for `facet` if it exists and implements `type_id`
    pub async fn checked_cast_facet(
        &self,
        facet: &str,
        type_id: &str,
    ) -> Result<Option<ObjectPrx>> {
        self.with_facet(facet).checked_cast(type_id).await
    }
}

impl fmt::Display for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.reference.fmt(f)
    }
}

impl fmt::Debug for ObjectPrx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ObjectPrx").field(&self.reference).finish()
    }
}

impl PartialEq for ObjectPrx {
    fn eq(&self, other: &Self) -> bool {
        self.reference == other.reference
    }
}

impl Eq for ObjectPrx {}

impl PartialOrd for ObjectPrx {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ObjectPrx {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reference.cmp(&other.reference)
    }
}

impl Hash for ObjectPrx {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.reference.hash(state);
    }
}
