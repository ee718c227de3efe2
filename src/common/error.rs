//! Error types for the proxy harness and its RPC runtime
//!
//! One enum covers configuration, proxy parsing, connections, remote
//! dispatch and test assertions. [`Error::kind`] folds the variants into the
//! coarse taxonomy the harness reports on.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the proxy harness
#[derive(Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file '{path}': {message}")]
    ConfigParse { path: String, message: String },

    #[error("Property '{key}' has invalid value '{value}': expected {expected}")]
    PropertyParse {
        key: String,
        value: String,
        expected: &'static str,
    },

    #[error("Interface definition '{name}' not found. Searched: {searched}")]
    SchemaNotFound { name: String, searched: String },

    #[error("Invalid interface definition: {0}")]
    Schema(String),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Parse Errors ===
    #[error("Invalid identity '{input}': {reason}")]
    IdentityParse { input: String, reason: String },

    #[error("Invalid endpoint '{input}': {reason}")]
    EndpointParse { input: String, reason: String },

    #[error("Invalid proxy '{input}': {reason}")]
    ProxyParse { input: String, reason: String },

    // === Runtime State Errors ===
    #[error("Communicator has been destroyed")]
    CommunicatorDestroyed,

    #[error("Object adapter '{0}' has been deactivated")]
    AdapterDeactivated(String),

    #[error("Object adapter '{0}' already exists")]
    AdapterAlreadyExists(String),

    #[error("Servant already registered for '{0}'")]
    AlreadyRegistered(String),

    // === Connection Errors ===
    #[error("Failed to connect to {endpoint}: {source}")]
    ConnectFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to listen on {endpoint}: {source}")]
    BindFailed {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {0} lost")]
    ConnectionLost(String),

    #[error("Connection to {0} closed by peer")]
    ConnectionClosed(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    // === Remote Dispatch Errors ===
    #[error("Object '{identity}' does not exist (facet '{facet}', operation '{operation}')")]
    ObjectNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Facet '{facet}' of object '{identity}' does not exist (operation '{operation}')")]
    FacetNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Operation '{operation}' does not exist on object '{identity}'")]
    OperationNotExist {
        identity: String,
        facet: String,
        operation: String,
    },

    #[error("Remote raised an unknown exception: {0}")]
    UnknownException(String),

    #[error("Remote raised user exception: {0}")]
    UserException(serde_json::Value),

    // === Proxy Usage Errors ===
    #[error("Proxy '{0}' has no endpoints")]
    NoEndpoint(String),

    #[error("Operation '{0}' requires a twoway proxy")]
    TwowayOnly(String),

    // === Test Errors ===
    #[error("Test assertion failed: {0}")]
    TestAssertion(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by the harness when reporting failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing configuration
    Configuration,
    /// A `test(condition)` check failed
    Assertion,
    /// Anything raised while talking to the remote side
    Remote,
    /// Local runtime misuse or I/O not tied to a remote call
    Local,
}

impl Error {
    /// Create a property parse error
    pub fn property_parse(key: &str, value: &str, expected: &'static str) -> Self {
        Self::PropertyParse {
            key: key.to_string(),
            value: value.to_string(),
            expected,
        }
    }

    /// Create a schema not found error with search paths
    pub fn schema_not_found<S: AsRef<str>>(name: &str, paths: &[S]) -> Self {
        Self::SchemaNotFound {
            name: name.to_string(),
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Create an identity parse error
    pub fn identity_parse(input: &str, reason: impl Into<String>) -> Self {
        Self::IdentityParse {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an endpoint parse error
    pub fn endpoint_parse(input: &str, reason: impl Into<String>) -> Self {
        Self::EndpointParse {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a proxy parse error
    pub fn proxy_parse(input: &str, reason: impl Into<String>) -> Self {
        Self::ProxyParse {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// Classify the error for failure reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_)
            | Error::ConfigParse { .. }
            | Error::PropertyParse { .. }
            | Error::SchemaNotFound { .. }
            | Error::Schema(_)
            | Error::FileRead { .. } => ErrorKind::Configuration,
            Error::TestAssertion(_) => ErrorKind::Assertion,
            Error::ConnectFailed { .. }
            | Error::ConnectionLost(_)
            | Error::ConnectionClosed(_)
            | Error::Timeout(_)
            | Error::Protocol(_)
            | Error::ObjectNotExist { .. }
            | Error::FacetNotExist { .. }
            | Error::OperationNotExist { .. }
            | Error::UnknownException(_)
            | Error::UserException(_) => ErrorKind::Remote,
            _ => ErrorKind::Local,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(Error::Config("x".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::property_parse("Rpc.MessageSizeMax", "big", "an integer").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(Error::TestAssertion("x".into()).kind(), ErrorKind::Assertion);
        assert_eq!(Error::ConnectionLost("tcp".into()).kind(), ErrorKind::Remote);
        assert_eq!(Error::CommunicatorDestroyed.kind(), ErrorKind::Local);
    }

    #[test]
    fn test_schema_not_found_message() {
        let err = Error::schema_not_found("Test.yaml", &["/a", "/b"]);
        assert_eq!(err.to_string(), "Interface definition 'Test.yaml' not found. Searched: /a, /b");
    }
}
