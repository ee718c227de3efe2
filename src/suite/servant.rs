//! Servant served by the proxy test server

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{MyDerivedClassPrx, MY_DERIVED_CLASS};
use crate::common::{Error, Result};
use crate::rpc::{Current, DispatchError, DispatchResult, Servant};
use crate::schema::Schema;

/// Implements `::Test::MyDerivedClass`
///
/// Operations not declared by the interface definitions are rejected with
/// `operation_not_exist`.
pub struct MyDerivedClassI {
    schema: Schema,
    type_id: String,
    type_ids: Vec<String>,
}

impl MyDerivedClassI {
    pub fn new(schema: Schema) -> Result<Self> {
        let type_id = schema.type_id(MY_DERIVED_CLASS);
        let type_ids = schema.type_ids(&type_id).ok_or_else(|| {
            Error::Schema(format!("interface '{}' is not defined", type_id))
        })?;
        Ok(Self {
            schema,
            type_id,
            type_ids,
        })
    }
}

#[async_trait]
impl Servant for MyDerivedClassI {
    fn type_id(&self) -> String {
        self.type_id.clone()
    }

    fn type_ids(&self) -> Vec<String> {
        self.type_ids.clone()
    }

    async fn dispatch(&self, current: &Current, params: Value) -> DispatchResult {
        if self.schema.operation(&self.type_id, &current.operation).is_none() {
            return Err(DispatchError::OperationNotExist);
        }

        match current.operation.as_str() {
            "shutdown" => {
                tracing::info!("Shutdown requested by client");
                current.adapter.shutdown_communicator();
                Ok(Value::Null)
            }
            "getContext" => Ok(json!(current.context)),
            "echo" => Ok(params
                .get(MyDerivedClassPrx::ECHO_PARAM)
                .cloned()
                .unwrap_or(Value::Null)),
            _ => Err(DispatchError::OperationNotExist),
        }
    }
}
