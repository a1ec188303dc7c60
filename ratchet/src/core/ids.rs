//! Validated identifiers for runs and graph nodes.
//!
//! Both are used as file names under `.ratchet/`, so they share one charset.

use std::fmt;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Validate that an id is safe for use as a single path component.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                validate_id(&id)?;
                Ok(Self(id))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = anyhow::Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Stable identifier of one end-to-end run.
    RunId
);

string_id!(
    /// Stable name of a registered node, resolved through the registry on
    /// every invocation so it survives process restarts.
    NodeRef
);

impl NodeRef {
    /// Built-in node names; their validity is covered by tests.
    pub(crate) fn from_static(name: &'static str) -> Self {
        Self(name.to_string())
    }
}

impl RunId {
    /// Placeholder used when an id cannot be recovered from a damaged record.
    pub(crate) fn unknown() -> Self {
        Self("unknown".to_string())
    }
}
