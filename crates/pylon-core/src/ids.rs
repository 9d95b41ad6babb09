//! Branded string identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, time-ordered identifier.
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an existing identifier without validation.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Identifies one agent (one live client connection).
    AgentId,
    "agent"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_has_prefix() {
        let id = AgentId::new();
        assert!(id.as_str().starts_with("agent_"), "got: {id}");
    }

    #[test]
    fn agent_ids_are_unique() {
        assert_ne!(AgentId::new(), AgentId::new());
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = AgentId::from_raw("agent_fixed");
        assert_eq!(id.as_str(), "agent_fixed");
        assert_eq!(id.to_string(), "agent_fixed");
    }

    #[test]
    fn serde_is_transparent() {
        let id = AgentId::from_raw("agent_x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"agent_x\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
