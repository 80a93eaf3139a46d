use serde::{Deserialize, Serialize};
use std::fmt;

/// Error produced when constructing a `HostId`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostIdError {
    #[error("host id must not be empty")]
    Empty,
}

/// Stable identifier of a managed host, as handed out by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostId(String);

impl HostId {
    pub fn new(id: &str) -> Result<Self, HostIdError> {
        if id.is_empty() {
            return Err(HostIdError::Empty);
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for HostId {
    type Error = HostIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            return Err(HostIdError::Empty);
        }
        Ok(Self(value))
    }
}

impl From<HostId> for String {
    fn from(id: HostId) -> Self {
        id.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_id_rejected() {
        assert_eq!(HostId::new("").unwrap_err(), HostIdError::Empty);
    }

    #[test]
    fn deserializes_from_plain_string() {
        let id: HostId = serde_json::from_str(r#""H1""#).unwrap();
        assert_eq!(id.as_str(), "H1");
        assert!(serde_json::from_str::<HostId>(r#""""#).is_err());
    }
}
