use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

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

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

branded_id!(ThreadId, "thread");
branded_id!(RunId, "run");
branded_id!(TaskId, "task");
branded_id!(CallId, "call");
branded_id!(NodeId, "node");

/// Number of argument/input characters that participate in a step key.
pub const STEP_KEY_PREFIX_CHARS: usize = 64;

/// Content-derived identifier of a reconstructed step.
///
/// Two observers that see the same logical step (live, replayed, or via a
/// snapshot task record) derive the same key, so the step collapses to one
/// record no matter how many times its events are delivered.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepKey(String);

impl StepKey {
    /// Hash of `kind | scope | name | detail-prefix`, truncated to 16 hex chars.
    pub fn derive(kind: &str, scope: Option<&str>, name: &str, detail: &str) -> Self {
        let prefix: String = detail.chars().take(STEP_KEY_PREFIX_CHARS).collect();
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update(b"|");
        hasher.update(scope.unwrap_or("").as_bytes());
        hasher.update(b"|");
        hasher.update(name.as_bytes());
        hasher.update(b"|");
        hasher.update(prefix.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        Self(format!("{kind}_{hex}"))
    }

    pub fn from_raw(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
