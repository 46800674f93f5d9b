//! Name and identity definitions.

use crate::{define_name, IdError};

// =============================================================================
// Application identity
// =============================================================================

define_name!(TenantName, "tenant name");
define_name!(ApplicationName, "application name");
define_name!(InstanceName, "instance name");

impl InstanceName {
    /// The instance every application gets unless another is named.
    pub fn default_instance() -> Self {
        Self("default".to_string())
    }
}

/// Identity of one deployed application instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationId {
    tenant: TenantName,
    application: ApplicationName,
    instance: InstanceName,
}

impl ApplicationId {
    /// Creates an id from its parts.
    #[must_use]
    pub fn new(tenant: TenantName, application: ApplicationName, instance: InstanceName) -> Self {
        Self {
            tenant,
            application,
            instance,
        }
    }

    /// Parses and validates each part.
    pub fn from_parts(tenant: &str, application: &str, instance: &str) -> Result<Self, IdError> {
        Ok(Self::new(
            TenantName::from(tenant)?,
            ApplicationName::from(application)?,
            InstanceName::from(instance)?,
        ))
    }

    /// Parses the serialized form `tenant:application:instance`.
    pub fn from_serialized_form(s: &str) -> Result<Self, IdError> {
        let parts: Vec<&str> = s.split(':').collect();
        let [tenant, application, instance] = parts.as_slice() else {
            return Err(IdError::InvalidFormat {
                kind: "application id",
                value: s.to_string(),
                expected: "tenant:application:instance",
            });
        };
        Self::from_parts(tenant, application, instance)
    }

    pub fn tenant(&self) -> &TenantName {
        &self.tenant
    }

    pub fn application(&self) -> &ApplicationName {
        &self.application
    }

    pub fn instance(&self) -> &InstanceName {
        &self.instance
    }

    /// The colon separated form used for storage keys.
    #[must_use]
    pub fn serialized_form(&self) -> String {
        format!("{}:{}:{}", self.tenant, self.application, self.instance)
    }

    /// The dotted `tenant.application.instance` form.
    #[must_use]
    pub fn to_full_string(&self) -> String {
        format!("{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

impl std::fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.tenant, self.application, self.instance)
    }
}

impl std::str::FromStr for ApplicationId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_serialized_form(s)
    }
}

impl serde::Serialize for ApplicationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.serialized_form())
    }
}

impl<'de> serde::Deserialize<'de> for ApplicationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_serialized_form(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Hosts
// =============================================================================

/// A DNS host name, lower-cased on parse.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostName(String);

impl HostName {
    pub const MAX_LEN: usize = 255;

    /// Parses and validates a host name.
    pub fn from(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "host name" });
        }

        if s.len() > Self::MAX_LEN {
            return Err(IdError::TooLong {
                kind: "host name",
                value: s.to_string(),
                max: Self::MAX_LEN,
            });
        }

        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.'))
        {
            return Err(IdError::IllegalCharacter {
                kind: "host name",
                value: s.to_string(),
                character: bad,
            });
        }

        Ok(Self(s.to_ascii_lowercase()))
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HostName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for HostName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from(s)
    }
}

impl serde::Serialize for HostName {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for HostName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
