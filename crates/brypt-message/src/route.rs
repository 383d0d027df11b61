//! Slash-delimited logical routes.
//!
//! A route names the handler a message is addressed to. The grammar is
//! `('/' [A-Za-z0-9]+)+` with a tolerated trailing slash; anything else is
//! rejected at parse time, so a constructed [`Path`] is always valid.

use std::fmt;
use std::str::FromStr;

use crate::{MessageError, Result};

/// An ordered, non-empty sequence of alphanumeric route components.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Path {
    components: Vec<String>,
}

fn is_valid_component(component: &str) -> bool {
    !component.is_empty() && component.chars().all(|c| c.is_ascii_alphanumeric())
}

impl Path {
    /// Parse a route string against the path grammar.
    pub fn parse(path: &str) -> Result<Self> {
        let Some(stripped) = path.strip_prefix('/') else {
            return Err(MessageError::RouteInvalid(path.to_string()));
        };

        // A single trailing slash is tolerated and dropped.
        let stripped = stripped.strip_suffix('/').unwrap_or(stripped);

        let components: Vec<String> = stripped.split('/').map(str::to_string).collect();
        if components.iter().any(|c| !is_valid_component(c)) {
            return Err(MessageError::RouteInvalid(path.to_string()));
        }

        Ok(Self { components })
    }

    /// The first component.
    pub fn root(&self) -> &str {
        &self.components[0]
    }

    /// The last component.
    pub fn tail(&self) -> &str {
        self.components.last().map(String::as_str).unwrap_or("")
    }

    /// The penultimate component, or empty for a single-component path.
    pub fn parent(&self) -> &str {
        if self.components.len() > 1 {
            &self.components[self.components.len() - 2]
        } else {
            ""
        }
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    /// Append a component, rejecting non-alphanumeric input.
    pub fn append(&mut self, component: &str) -> bool {
        if !is_valid_component(component) {
            return false;
        }
        self.components.push(component.to_string());
        true
    }

    /// Replace the last component, rejecting non-alphanumeric input.
    pub fn set_tail(&mut self, component: &str) -> bool {
        if !is_valid_component(component) {
            return false;
        }
        if let Some(tail) = self.components.last_mut() {
            *tail = component.to_string();
        }
        true
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for component in &self.components {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self> {
        Path::parse(s)
    }
}
