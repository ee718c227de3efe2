//! Runtime properties
//!
//! Properties are the configuration layer of the runtime: a flat map of
//! dotted keys to string values. They come from command-line options of the
//! form `--Rpc.Trace.Network=1` and from TOML configuration files named by
//! `Rpc.Config` (or the `RPC_CONFIG` environment variable). Command-line
//! values always win over file values.

use std::collections::BTreeMap;
use std::path::Path;

use super::{Error, Result};

/// Prefixes the runtime claims on the command line
pub const RESERVED_PREFIXES: &[&str] = &["Rpc", "Test"];

/// Environment variable naming configuration files when `Rpc.Config` is unset
pub const CONFIG_ENV: &str = "RPC_CONFIG";

/// Runtime properties the communicator understands
const KNOWN_RUNTIME_PROPERTIES: &[&str] = &[
    "Rpc.Config",
    "Rpc.Default.Host",
    "Rpc.Default.Protocol",
    "Rpc.MessageSizeMax",
    "Rpc.Override.ConnectTimeout",
    "Rpc.Override.Timeout",
    "Rpc.Trace.Network",
    "Rpc.Trace.Protocol",
    "Rpc.Warn.Connections",
];

/// A set of configuration properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    /// Create an empty property set
    pub fn new() -> Self {
        Self::default()
    }

    /// Build properties from a process argument list
    ///
    /// Returns the properties and the arguments that were not consumed.
    /// Configuration files named by `Rpc.Config` are loaded and then the
    /// command-line values are re-applied on top of them.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut props = Self::new();
        let mut remaining = args.to_vec();
        for prefix in RESERVED_PREFIXES {
            remaining = props.parse_command_line_options(prefix, &remaining);
        }

        let config = props
            .get("Rpc.Config")
            .map(str::to_string)
            .or_else(|| std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()));

        if let Some(files) = config {
            let overrides = props.clone();
            for file in files.split(',').map(str::trim).filter(|f| !f.is_empty()) {
                props.load(Path::new(file))?;
            }
            props.values.extend(overrides.values);
        }

        props.warn_unknown();
        Ok((props, remaining))
    }

    /// Consume `--<prefix>.Key[=value]` options from an argument list
    ///
    /// Returns the arguments that did not match. A bare `--<prefix>.Key`
    /// sets the value `1`.
    pub fn parse_command_line_options(&mut self, prefix: &str, args: &[String]) -> Vec<String> {
        let marker = format!("--{prefix}.");
        let mut remaining = Vec::with_capacity(args.len());

        for arg in args {
            let Some(option) = arg.strip_prefix("--") else {
                remaining.push(arg.clone());
                continue;
            };
            if !arg.starts_with(&marker) {
                remaining.push(arg.clone());
                continue;
            }

            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (option.trim(), "1"),
            };
            self.set(key, value);
        }

        remaining
    }

    /// Load properties from a TOML configuration file
    ///
    /// Nested tables flatten to dotted keys, so `[Rpc.Trace] Network = 1`
    /// sets `Rpc.Trace.Network`. Arrays become comma-separated lists.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        let table: toml::Table = toml::from_str(&content).map_err(|e| Error::ConfigParse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "Loading configuration file");
        self.flatten("", &table);
        Ok(())
    }

    fn flatten(&mut self, prefix: &str, table: &toml::Table) {
        for (key, value) in table {
            let full_key = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                toml::Value::Table(nested) => self.flatten(&full_key, nested),
                other => {
                    let rendered = render_scalar(other);
                    self.values.insert(full_key, rendered);
                }
            }
        }
    }

    /// Set a property; an empty value removes it
    pub fn set(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.values.remove(key);
        } else {
            self.values.insert(key.to_string(), value.to_string());
        }
    }

    /// Get a property value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Get a property value or a default
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Get an integer property, falling back to a default when unset
    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            Some(value) => value
                .parse()
                .map_err(|_| Error::property_parse(key, value, "an integer")),
            None => Ok(default),
        }
    }

    /// Get a boolean property (`1`/`0`/`true`/`false`/`yes`/`no`)
    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::property_parse(key, value, "a boolean")),
            },
            None => Ok(default),
        }
    }

    /// All properties whose key starts with `prefix`
    pub fn get_for_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of properties set
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no property is set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn warn_unknown(&self) {
        for key in self.get_for_prefix("Rpc.").keys() {
            if !KNOWN_RUNTIME_PROPERTIES.contains(&key.as_str()) {
                tracing::warn!(property = %key, "Unknown runtime property");
            }
        }
    }
}

fn render_scalar(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(render_scalar)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_from_empty_args() {
        let (props, remaining) = Properties::from_args(&[]).unwrap();
        assert!(props.is_empty());
        assert!(remaining.is_empty());
    }

    #[test]
    fn test_reserved_prefixes_are_consumed() {
        let (props, remaining) = Properties::from_args(&args(&[
            "proxy-client",
            "--Rpc.Trace.Network=2",
            "--Test.Proxy=test:tcp -p 12010",
            "--verbose",
            "--Other.Key=1",
        ]))
        .unwrap();

        assert_eq!(props.get("Rpc.Trace.Network"), Some("2"));
        assert_eq!(props.get("Test.Proxy"), Some("test:tcp -p 12010"));
        assert_eq!(remaining, args(&["proxy-client", "--verbose", "--Other.Key=1"]));
    }

    #[test]
    fn test_bare_option_sets_one() {
        let (props, _) = Properties::from_args(&args(&["--Rpc.Warn.Connections"])).unwrap();
        assert!(props.get_bool_or("Rpc.Warn.Connections", false).unwrap());
    }

    #[test]
    fn test_empty_value_removes() {
        let mut props = Properties::new();
        props.set("Rpc.Default.Host", "localhost");
        let rest = props.parse_command_line_options("Rpc", &args(&["--Rpc.Default.Host="]));
        assert!(rest.is_empty());
        assert_eq!(props.get("Rpc.Default.Host"), None);
    }

    #[test]
    fn test_typed_getters() {
        let mut props = Properties::new();
        props.set("Rpc.MessageSizeMax", "2048");
        props.set("Rpc.Override.Timeout", "soon");
        assert_eq!(props.get_int_or("Rpc.MessageSizeMax", 1024).unwrap(), 2048);
        assert_eq!(props.get_int_or("Rpc.Trace.Network", 0).unwrap(), 0);
        assert!(matches!(
            props.get_int_or("Rpc.Override.Timeout", -1),
            Err(Error::PropertyParse { .. })
        ));
        assert_eq!(props.get_or("Rpc.Default.Host", "127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_get_for_prefix() {
        let mut props = Properties::new();
        props.set("Test.Proxy.Context.one", "hello");
        props.set("Test.Proxy.Context.two", "world");
        props.set("Test.Proxy", "test");
        props.set("Test.Other", "x");
        let ctx = props.get_for_prefix("Test.Proxy.Context.");
        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx["Test.Proxy.Context.one"], "hello");
    }

    #[test]
    fn test_config_file_with_command_line_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            concat!(
                "[Rpc.Trace]\nNetwork = 1\nProtocol = 1\n\n",
                "[Test]\nProxy = \"test:tcp -p 1\"\nFlag = true",
            )
        )
        .unwrap();

        let config = format!("--Rpc.Config={}", file.path().display());
        let (props, _) =
            Properties::from_args(&args(&[&config, "--Rpc.Trace.Network=3"])).unwrap();

        assert_eq!(props.get("Rpc.Trace.Network"), Some("3"));
        assert_eq!(props.get("Rpc.Trace.Protocol"), Some("1"));
        assert_eq!(props.get("Test.Proxy"), Some("test:tcp -p 1"));
        assert_eq!(props.get("Test.Flag"), Some("1"));
    }

    #[test]
    fn test_missing_config_file() {
        let result = Properties::from_args(&args(&["--Rpc.Config=/nonexistent/rpc.toml"]));
        assert!(matches!(result, Err(Error::FileRead { .. })));
    }

    #[test]
    fn test_malformed_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is = = not toml").unwrap();
        let config = format!("--Rpc.Config={}", file.path().display());
        let result = Properties::from_args(&args(&[&config]));
        assert!(matches!(result, Err(Error::ConfigParse { .. })));
    }
}
