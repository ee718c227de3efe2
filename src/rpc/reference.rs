//! Proxy references
//!
//! A reference is the pure-data part of a proxy: everything that makes two
//! proxies equal or different. Its stringified form is
//!
//! ```text
//! identity [-f facet] [-t | -o] [-s] [:endpoint]*
//! identity [-f facet] [-t | -o] [-s] @ adapter-id
//! ```
//!
//! Identity, facet and adapter id may be double-quoted when they contain
//! whitespace, `:` or `@`.

use std::fmt;

use super::endpoint::{Endpoint, EndpointDefaults};
use super::identity::{self, Identity};
use super::protocol::Context;
use crate::common::{Error, Result};

/// How requests are sent through a proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InvocationMode {
    /// Request and wait for the reply
    #[default]
    Twoway,
    /// Fire and forget
    Oneway,
}

/// Data identifying a proxy target and how to reach it
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub identity: Identity,
    pub facet: String,
    pub mode: InvocationMode,
    pub secure: bool,
    pub endpoints: Vec<Endpoint>,
    pub adapter_id: String,
    pub context: Context,
}

impl Reference {
    /// Direct reference to an identity at the given endpoints
    pub fn new(identity: Identity, endpoints: Vec<Endpoint>) -> Self {
        Self {
            identity,
            endpoints,
            ..Self::default()
        }
    }

    /// Parse a stringified proxy
    pub fn parse(s: &str, defaults: &EndpointDefaults) -> Result<Self> {
        let (tokens, rest) = tokenize(s)?;
        let mut tokens = tokens.into_iter();

        let identity_token = tokens
            .next()
            .ok_or_else(|| Error::proxy_parse(s, "no identity"))?;
        let identity = Identity::parse(&identity_token)?;

        let mut reference = Self::new(identity, Vec::new());
        let mut mode_set = false;

        while let Some(option) = tokens.next() {
            match option.as_str() {
                "-f" => {
                    let facet = tokens
                        .next()
                        .ok_or_else(|| Error::proxy_parse(s, "no argument for option -f"))?;
                    reference.facet =
                        identity::unescape(&facet).map_err(|reason| Error::proxy_parse(s, reason))?;
                }
                "-t" | "-o" => {
                    if mode_set {
                        return Err(Error::proxy_parse(s, "more than one invocation mode"));
                    }
                    mode_set = true;
                    reference.mode = if option == "-t" {
                        InvocationMode::Twoway
                    } else {
                        InvocationMode::Oneway
                    };
                }
                "-s" => reference.secure = true,
                "-O" | "-d" | "-D" => {
                    return Err(Error::proxy_parse(
                        s,
                        format!("invocation mode {option} is not supported"),
                    ))
                }
                other => {
                    return Err(Error::proxy_parse(s, format!("unknown option '{other}'")));
                }
            }
        }

        match rest {
            Some(Rest::Endpoints(list)) => {
                for part in list.split(':') {
                    let part = part.trim();
                    if part.is_empty() {
                        return Err(Error::proxy_parse(s, "empty endpoint"));
                    }
                    reference.endpoints.push(Endpoint::parse_with(part, defaults)?);
                }
            }
            Some(Rest::Adapter(id)) => {
                let raw = id.trim();
                let quoted = is_quoted(raw);
                let id = strip_quotes(raw);
                if id.is_empty() || (!quoted && id.contains(char::is_whitespace)) {
                    return Err(Error::proxy_parse(s, "invalid adapter id"));
                }
                reference.adapter_id =
                    identity::unescape(id).map_err(|reason| Error::proxy_parse(s, reason))?;
            }
            None => {}
        }

        Ok(reference)
    }
}

enum Rest<'a> {
    Endpoints(&'a str),
    Adapter(&'a str),
}

/// Split the leading part of a proxy string into whitespace-separated
/// tokens, stopping at the first unquoted `:` or `@`
fn tokenize(s: &str) -> Result<(Vec<String>, Option<Rest<'_>>)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = s.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                in_token = true;
                if let Some((_, next)) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if quoted => current.push(c),
            ':' | '@' => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                }
                let rest = &s[i + 1..];
                let rest = if c == ':' {
                    Rest::Endpoints(rest)
                } else {
                    Rest::Adapter(rest)
                };
                return Ok((tokens, Some(rest)));
            }
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(Error::proxy_parse(s, "mismatched quotes"));
    }
    if in_token {
        tokens.push(current);
    }
    Ok((tokens, None))
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('"') && s.ends_with('"')
}

fn strip_quotes(s: &str) -> &str {
    if is_quoted(s) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Quote a token if it would otherwise be split or cut short
fn quote_if_needed(s: &str) -> String {
    if s.is_empty() || s.contains(|c: char| c.is_whitespace() || c == ':' || c == '@') {
        format!("\"{s}\"")
    } else {
        s.to_string()
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", quote_if_needed(&self.identity.to_string()))?;
        if !self.facet.is_empty() {
            write!(f, " -f {}", quote_if_needed(&identity::escape(&self.facet)))?;
        }
        match self.mode {
            InvocationMode::Twoway => write!(f, " -t")?,
            InvocationMode::Oneway => write!(f, " -o")?,
        }
        if self.secure {
            write!(f, " -s")?;
        }
        if !self.adapter_id.is_empty() {
            write!(f, " @ {}", quote_if_needed(&identity::escape(&self.adapter_id)))?;
        } else {
            for endpoint in &self.endpoints {
                write!(f, ":{endpoint}")?;
            }
        }
        Ok(())
    }
}
