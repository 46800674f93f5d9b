//! Macros for defining validated name types.

/// Macro to define a validated name with a specific kind label.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `from()` to parse and validate a string
/// - `value()` to borrow the validated string
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// Valid names start with an ASCII letter or underscore, continue with
/// ASCII alphanumerics, `-` or `_`, and are at most 64 characters.
///
/// # Example
///
/// ```ignore
/// define_name!(TenantName, "tenant name");
///
/// let tenant = TenantName::from("music")?;
/// let parsed: TenantName = "music".parse()?;
/// ```
#[macro_export]
macro_rules! define_name {
    ($name:ident, $kind:literal) => {
        /// A validated name of this kind.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Label used in error messages.
            pub const KIND: &'static str = $kind;

            /// Maximum accepted length.
            pub const MAX_LEN: usize = 64;

            /// Parses and validates a name.
            pub fn from(s: &str) -> Result<Self, $crate::IdError> {
                let Some(first) = s.chars().next() else {
                    return Err($crate::IdError::Empty { kind: Self::KIND });
                };

                if s.len() > Self::MAX_LEN {
                    return Err($crate::IdError::TooLong {
                        kind: Self::KIND,
                        value: s.to_string(),
                        max: Self::MAX_LEN,
                    });
                }

                if !(first.is_ascii_alphabetic() || first == '_') {
                    return Err($crate::IdError::IllegalCharacter {
                        kind: Self::KIND,
                        value: s.to_string(),
                        character: first,
                    });
                }

                if let Some(bad) = s
                    .chars()
                    .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
                {
                    return Err($crate::IdError::IllegalCharacter {
                        kind: Self::KIND,
                        value: s.to_string(),
                        character: bad,
                    });
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the validated string.
            #[must_use]
            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::from(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}
