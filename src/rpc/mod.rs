//! Minimal RPC runtime
//!
//! Communicators, proxies and object adapters talking length-prefixed JSON
//! over TCP or local sockets via the interprocess crate.

pub mod adapter;
pub mod communicator;
pub mod connection;
pub mod endpoint;
pub mod identity;
mod instance;
pub mod protocol;
pub mod proxy;
pub mod reference;
pub mod settings;
pub mod transport;

pub use adapter::{Current, DispatchError, DispatchResult, ObjectAdapter, Servant};
pub use communicator::{Communicator, InitializationData};
pub use endpoint::Endpoint;
pub use identity::Identity;
pub use protocol::{Context, OperationMode, OBJECT_TYPE_ID};
pub use proxy::ObjectPrx;
pub use reference::{InvocationMode, Reference};
