//! `name@version` library references as written in pipeline definitions

use crate::error::{PipelibError, PipelibResult};
use std::fmt;
use std::str::FromStr;

/// A request for a library, optionally pinned to a version token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryReference {
    pub name: String,
    /// Raw version token; may be a placeholder such as `${BRANCH_NAME}`
    pub version: Option<String>,
}

impl LibraryReference {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse `name` or `name@version`; the first `@` splits.
    pub fn parse(reference: &str) -> PipelibResult<Self> {
        let invalid = |reason: &str| PipelibError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let (name, version) = match reference.split_once('@') {
            Some((name, version)) => {
                if version.is_empty() {
                    return Err(invalid("empty version after '@'"));
                }
                (name, Some(version.to_string()))
            }
            None => (reference, None),
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(invalid("missing library name"));
        }

        Ok(Self::new(name, version))
    }
}

impl FromStr for LibraryReference {
    type Err = PipelibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LibraryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}
