//! Strongly-typed identifiers used across the orchestrator.
//!
//! These newtypes keep image names, host names, build identifiers and
//! container ids from being mixed up at call sites while serializing as
//! plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Declares a `String`-backed identifier that serializes as a bare string
/// and can be looked up in maps by `&str`.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The identifier as it appears in paths, requests and logs.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

newtype_string!(
    /// Name of a registered image. Doubles as its directory name under the
    /// images root.
    ImageName
);

newtype_string!(
    /// Configured name of a remote host (the key in the `servers` map).
    HostName
);

newtype_string!(
    /// Opaque reference to an image built on one specific host.
    BuildId
);

newtype_string!(
    /// Runtime-assigned container identifier.
    ContainerId
);
