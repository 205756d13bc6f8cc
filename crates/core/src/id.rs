// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifier newtypes for emulators and resolve rules.
//!
//! Both identifier kinds share the same charset: non-empty strings of
//! letters, digits, `.`, `_`, and `-`.

use crate::error::BrokerError;

/// Check that an identifier is non-empty and uses only letters, digits,
/// `.`, `_`, and `-`.
pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Define a newtype ID wrapper around `String`.
///
/// Generates `new()`, `validated()`, `as_str()`, `Display`, `From<String>`,
/// `From<&str>`, `PartialEq<str>`, `PartialEq<&str>`, and `Borrow<str>`
/// implementations.
#[macro_export]
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Construct after checking the identifier charset.
            pub fn validated(id: impl Into<String>) -> Result<Self, $crate::error::BrokerError> {
                let id = id.into();
                if $crate::id::valid_id(&id) {
                    Ok(Self(id))
                } else {
                    Err($crate::error::BrokerError::InvalidArgument(format!(
                        concat!("bad ", stringify!($name), ": {:?}"),
                        id
                    )))
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id! {
    /// Unique identifier for a registered emulator.
    pub struct EmulatorId;
}

define_id! {
    /// Unique identifier for a resolve rule.
    pub struct RuleId;
}

impl EmulatorId {
    /// Validate the charset of an existing id.
    pub fn check(&self) -> Result<(), BrokerError> {
        if valid_id(&self.0) {
            Ok(())
        } else {
            Err(BrokerError::InvalidArgument(format!(
                "bad emulator_id: {:?}",
                self.0
            )))
        }
    }
}

impl RuleId {
    /// Validate the charset of an existing id.
    pub fn check(&self) -> Result<(), BrokerError> {
        if valid_id(&self.0) {
            Ok(())
        } else {
            Err(BrokerError::InvalidArgument(format!(
                "bad rule_id: {:?}",
                self.0
            )))
        }
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
