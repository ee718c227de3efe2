//! Runtime settings derived from properties
//!
//! Parsed once when the communicator is initialized so that malformed
//! values fail bootstrap instead of the first invocation.

use crate::common::{Error, Properties, Result};

use super::transport::DEFAULT_MESSAGE_SIZE_MAX;

/// Largest `Rpc.MessageSizeMax` (in KiB) that still fits the frame header
const MESSAGE_SIZE_MAX_KIB_LIMIT: i64 = (u32::MAX / 1024) as i64;

/// Settings shared by connections and object adapters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Maximum frame size in bytes
    pub message_size_max: u32,
    /// Replaces every endpoint's invocation timeout when set
    pub override_timeout: Option<u64>,
    /// Replaces every endpoint's connect timeout when set
    pub override_connect_timeout: Option<u64>,
    /// `Rpc.Trace.Network` level
    pub trace_network: i64,
    /// `Rpc.Trace.Protocol` level
    pub trace_protocol: i64,
    /// Warn when an established connection is lost
    pub warn_connections: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            override_timeout: None,
            override_connect_timeout: None,
            trace_network: 0,
            trace_protocol: 0,
            warn_connections: false,
        }
    }
}

impl Settings {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let defaults = Self::default();

        let kib = props.get_int_or(
            "Rpc.MessageSizeMax",
            i64::from(defaults.message_size_max / 1024),
        )?;
        if kib <= 0 || kib > MESSAGE_SIZE_MAX_KIB_LIMIT {
            return Err(Error::property_parse(
                "Rpc.MessageSizeMax",
                &kib.to_string(),
                "a positive size in KiB",
            ));
        }

        Ok(Self {
            message_size_max: (kib as u32) * 1024,
            override_timeout: timeout_property(props, "Rpc.Override.Timeout")?,
            override_connect_timeout: timeout_property(props, "Rpc.Override.ConnectTimeout")?,
            trace_network: props.get_int_or("Rpc.Trace.Network", 0)?,
            trace_protocol: props.get_int_or("Rpc.Trace.Protocol", 0)?,
            warn_connections: props.get_bool_or("Rpc.Warn.Connections", false)?,
        })
    }
}

/// `-1` or unset means no override; otherwise a positive number of ms
fn timeout_property(props: &Properties, key: &str) -> Result<Option<u64>> {
    match props.get_int_or(key, -1)? {
        -1 => Ok(None),
        ms if ms > 0 => Ok(Some(ms as u64)),
        ms => Err(Error::property_parse(
            key,
            &ms.to_string(),
            "-1 or a positive number of milliseconds",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_properties(&Properties::new()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.message_size_max, 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let mut props = Properties::new();
        props.set("Rpc.MessageSizeMax", "64");
        props.set("Rpc.Override.Timeout", "250");
        props.set("Rpc.Trace.Network", "2");
        props.set("Rpc.Warn.Connections", "1");
        let settings = Settings::from_properties(&props).unwrap();
        assert_eq!(settings.message_size_max, 64 * 1024);
        assert_eq!(settings.override_timeout, Some(250));
        assert_eq!(settings.override_connect_timeout, None);
        assert_eq!(settings.trace_network, 2);
        assert!(settings.warn_connections);
    }

    #[test]
    fn test_invalid_values() {
        for (key, value) in [
            ("Rpc.MessageSizeMax", "0"),
            ("Rpc.MessageSizeMax", "huge"),
            ("Rpc.Override.Timeout", "0"),
            ("Rpc.Override.ConnectTimeout", "-5"),
            ("Rpc.Warn.Connections", "maybe"),
        ] {
            let mut props = Properties::new();
            props.set(key, value);
            assert!(
                Settings::from_properties(&props).is_err(),
                "{key}={value} should be rejected"
            );
        }
    }
}
