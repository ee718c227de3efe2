//! Object identities
//!
//! An identity names a servant inside an object adapter. Its string form is
//! `category/name`, or just `name` when the category is empty. Characters
//! that would be ambiguous in that form are backslash-escaped.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::common::{Error, Result};

/// Identity of a remote object
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub category: String,
}

impl Identity {
    /// Identity with an empty category
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: String::new(),
        }
    }

    /// Identity with a category
    pub fn with_category(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// Parse the stringified form of an identity
    pub fn parse(s: &str) -> Result<Self> {
        let parts = split_unescaped_slash(s);
        let (category, name) = match parts.as_slice() {
            [name] => ("", *name),
            [category, name] => (*category, *name),
            _ => return Err(Error::identity_parse(s, "more than one unescaped '/'")),
        };

        let name = unescape(name).map_err(|reason| Error::identity_parse(s, reason))?;
        if name.is_empty() {
            return Err(Error::identity_parse(s, "name must not be empty"));
        }
        let category = unescape(category).map_err(|reason| Error::identity_parse(s, reason))?;

        Ok(Self { name, category })
    }
}

fn split_unescaped_slash(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '/' => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Decode the backslash escapes produced by [`escape`]
pub fn unescape(s: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = chars.next().ok_or("trailing backslash")?;
        let decoded = match escaped {
            '\\' | '/' | '"' | '\'' => escaped,
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            'b' => '\u{8}',
            'f' => '\u{c}',
            '0'..='7' => {
                let mut value = escaped.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    match chars.peek().and_then(|d| d.to_digit(8)) {
                        Some(digit) => {
                            value = value * 8 + digit;
                            chars.next();
                        }
                        None => break,
                    }
                }
                if value > 0xff {
                    return Err("octal escape out of range".to_string());
                }
                char::from(value as u8)
            }
            other => return Err(format!("invalid escape sequence '\\{other}'")),
        };
        out.push(decoded);
    }

    Ok(out)
}

impl FromStr for Identity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.category.is_empty() {
            write!(f, "{}", escape(&self.name))
        } else {
            write!(f, "{}/{}", escape(&self.category), escape(&self.name))
        }
    }
}

/// Escape a single identity component
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '/' => out.push_str("\\/"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}
