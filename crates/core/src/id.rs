//! Stream identifiers.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Identifies one ordered, append-only log: `(category, id)`.
///
/// The category groups streams of the same kind (e.g. `"order"`), the id
/// distinguishes instances within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub category: String,
    pub id: String,
}

impl StreamId {
    pub fn new(category: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            id: id.into(),
        }
    }

    /// Check that both components can be embedded in a `.`-separated,
    /// space-separated and `#`-separated textual form.
    ///
    /// Backends that encode stream ids into filenames call this before
    /// writing anything.
    pub fn validate_components(&self) -> DomainResult<()> {
        validate_component("category", &self.category)
            .and_then(|_| validate_component("id", &self.id))
            .map_err(|e| DomainError::invalid_id(format!("stream {self}: {e}")))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.id)
    }
}

/// Validate a single textual component (stream category, stream id or event
/// type) for use inside a filename.
pub fn validate_component(what: &str, value: &str) -> DomainResult<()> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{what} must not be empty")));
    }
    if let Some(c) = value.chars().find(|c| is_reserved(*c)) {
        return Err(DomainError::validation(format!(
            "{what} {value:?} contains reserved character {c:?}"
        )));
    }
    Ok(())
}

fn is_reserved(c: char) -> bool {
    matches!(c, '.' | '/' | '\\' | '#') || c.is_whitespace() || c.is_control()
}
