//! Proxy Harness - conformance tests for an RPC proxy layer
//!
//! This library provides a small RPC runtime (communicators, proxies and
//! object adapters), the proxy test suite that exercises it, and the
//! one-shot harness that drives the suite and turns its outcome into an
//! exit status.

pub mod common;
pub mod harness;
pub mod rpc;
pub mod schema;
pub mod suite;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use harness::{RunStatus, RuntimeHandle, TestSuite};
