//! Interface definitions
//!
//! The test suite checks the runtime's type queries against interface
//! definitions loaded from a YAML file:
//!
//! ```yaml
//! module: Test
//! interfaces:
//!   - name: MyClass
//!     operations:
//!       - name: getContext
//!         idempotent: true
//!         returns: context
//!   - name: MyDerivedClass
//!     bases: [MyClass]
//! ```
//!
//! Type ids are `::<module>::<interface>`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Deserialize;

use crate::common::{Error, Result};
use crate::rpc::protocol::OBJECT_TYPE_ID;

/// Top-level YAML document
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    module: String,
    #[serde(default)]
    interfaces: Vec<InterfaceDef>,
}

/// One interface definition
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct InterfaceDef {
    pub name: String,
    /// Names of interfaces in the same module this one extends
    #[serde(default)]
    pub bases: Vec<String>,
    #[serde(default)]
    pub operations: Vec<OperationDef>,
}

/// One operation of an interface
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OperationDef {
    pub name: String,
    /// Safe to retry after a lost connection
    #[serde(default)]
    pub idempotent: bool,
    /// Free-form description of the result, absent for no result
    pub returns: Option<String>,
}

/// Validated set of interface definitions
#[derive(Debug, Clone)]
pub struct Schema {
    module: String,
    /// Keyed by type id
    interfaces: BTreeMap<String, InterfaceDef>,
}

impl Schema {
    /// Load and validate a YAML interface definition file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let schema = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            interfaces = schema.interfaces.len(),
            "Loaded interface definitions"
        );
        Ok(schema)
    }

    /// Parse and validate YAML interface definitions
    pub fn parse(content: &str) -> Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(content)
            .map_err(|e| Error::Schema(format!("failed to parse YAML: {}", e)))?;

        if !is_identifier(&file.module) {
            return Err(Error::Schema(format!("invalid module name '{}'", file.module)));
        }

        let mut interfaces = BTreeMap::new();
        for interface in file.interfaces {
            if !is_identifier(&interface.name) {
                return Err(Error::Schema(format!(
                    "invalid interface name '{}'",
                    interface.name
                )));
            }

            let mut seen = BTreeSet::new();
            for op in &interface.operations {
                if !is_identifier(&op.name) || op.name.starts_with("rpc_") {
                    return Err(Error::Schema(format!(
                        "invalid operation name '{}' in interface '{}'",
                        op.name, interface.name
                    )));
                }
                if !seen.insert(op.name.as_str()) {
                    return Err(Error::Schema(format!(
                        "duplicate operation '{}' in interface '{}'",
                        op.name, interface.name
                    )));
                }
            }

            let type_id = format!("::{}::{}", file.module, interface.name);
            if interfaces.insert(type_id, interface.clone()).is_some() {
                return Err(Error::Schema(format!(
                    "duplicate interface '{}'",
                    interface.name
                )));
            }
        }

        let schema = Self {
            module: file.module,
            interfaces,
        };
        schema.check_bases()?;
        Ok(schema)
    }

    /// Every base must exist and the inheritance graph must be acyclic
    fn check_bases(&self) -> Result<()> {
        for interface in self.interfaces.values() {
            for base in &interface.bases {
                if !self.interfaces.contains_key(&self.type_id(base)) {
                    return Err(Error::Schema(format!(
                        "interface '{}' extends unknown interface '{}'",
                        interface.name, base
                    )));
                }
            }
        }

        let mut done = BTreeSet::new();
        for type_id in self.interfaces.keys() {
            let mut path = Vec::new();
            self.visit(type_id, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit<'a>(
        &'a self,
        type_id: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Result<()> {
        if done.contains(type_id) {
            return Ok(());
        }
        if path.contains(&type_id) {
            return Err(Error::Schema(format!(
                "inheritance cycle through '{}'",
                type_id
            )));
        }

        path.push(type_id);
        if let Some((key, interface)) = self.interfaces.get_key_value(type_id) {
            for base in &interface.bases {
                let base_id = self.type_id(base);
                if let Some((base_key, _)) = self.interfaces.get_key_value(&base_id) {
                    self.visit(base_key, path, done)?;
                }
            }
            done.insert(key.as_str());
        }
        path.pop();
        Ok(())
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Type id of an interface in this module
    pub fn type_id(&self, name: &str) -> String {
        format!("::{}::{}", self.module, name)
    }

    pub fn interface(&self, type_id: &str) -> Option<&InterfaceDef> {
        self.interfaces.get(type_id)
    }

    /// Find an operation on an interface or any of its bases
    pub fn operation(&self, type_id: &str, name: &str) -> Option<&OperationDef> {
        let interface = self.interface(type_id)?;
        if let Some(op) = interface.operations.iter().find(|op| op.name == name) {
            return Some(op);
        }
        interface
            .bases
            .iter()
            .find_map(|base| self.operation(&self.type_id(base), name))
    }

    /// Sorted type ids an object of `type_id` implements
    ///
    /// Includes the interface itself, its transitive bases and
    /// `::Rpc::Object`. `None` for an unknown interface.
    pub fn type_ids(&self, type_id: &str) -> Option<Vec<String>> {
        self.interface(type_id)?;

        let mut ids = BTreeSet::new();
        ids.insert(OBJECT_TYPE_ID.to_string());
        let mut pending = vec![type_id.to_string()];
        while let Some(id) = pending.pop() {
            if let Some(interface) = self.interface(&id) {
                pending.extend(interface.bases.iter().map(|b| self.type_id(b)));
            }
            ids.insert(id);
        }
        Some(ids.into_iter().collect())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
