//! Strongly-typed identifiers for fleet entities.
//!
//! Every identifier is a `u64` assigned by the durable store. Wrapping them in
//! distinct types keeps a label ID from being passed where a host ID is expected:
//!
//! ```rust
//! use fleet_core::id::{HostId, LabelId};
//!
//! let host = HostId::new(7);
//! let label = LabelId::new(7);
//!
//! // IDs are different types - this won't compile:
//! // let wrong: HostId = label;
//! assert_eq!(host.get(), label.get());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw identifier.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw identifier.
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

define_id!(
    /// Identifies a reporting agent (an enrolled host).
    HostId,
    "host ID"
);

define_id!(
    /// Identifies a label whose query hosts report membership for.
    LabelId,
    "label ID"
);

define_id!(
    /// Identifies a policy whose query hosts report pass/fail for.
    PolicyId,
    "policy ID"
);

define_id!(
    /// Identifies a scheduled query inside a pack.
    ScheduledQueryId,
    "scheduled query ID"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip_through_strings() {
        let host: HostId = "42".parse().expect("parse");
        assert_eq!(host, HostId::new(42));
        assert_eq!(host.to_string(), "42");
    }

    #[test]
    fn invalid_id_names_the_type() {
        let err = "abc".parse::<PolicyId>().unwrap_err();
        assert!(err.to_string().contains("policy ID"));
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&LabelId::new(9)).expect("serialize");
        assert_eq!(json, "9");
    }

    #[test]
    fn ids_order_by_raw_value() {
        let mut ids = vec![HostId::new(3), HostId::new(1), HostId::new(2)];
        ids.sort();
        assert_eq!(ids, vec![HostId::new(1), HostId::new(2), HostId::new(3)]);
    }
}
