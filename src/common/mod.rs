//! Common utilities shared between the client harness and the test server

pub mod error;
pub mod logging;
pub mod paths;
pub mod properties;

pub use error::{Error, ErrorKind, Result};
pub use properties::Properties;

/// Best-effort message from a caught panic payload
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Parse a "listening at:" endpoint from server output.
/// Handles wildcard hosts by converting them to the loopback address
pub fn parse_listen_address(line: &str) -> Option<String> {
    let addr_start = line.find("listening at:")?;
    let addr = line[addr_start + "listening at:".len()..].trim().to_string();
    if addr.is_empty() {
        return None;
    }
    Some(
        addr.replace("-h 0.0.0.0 ", "-h 127.0.0.1 ")
            .replace("-h :: ", "-h ::1 "),
    )
}
