use std::fmt;

use crate::entity::Entity;

/// Shared local key of a device. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for handing to the transport
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// What the device transport needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub address: String,
    pub key: Credential,
    pub version: String,
}

/// A bridged device and its entities, in publishing order
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub mac: String,
    pub address: String,
    pub key: Credential,
    pub version: String,
    pub manufacturer: String,
    pub model: String,
    pub entities: Vec<Entity>,
}

impl Device {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            id: self.id.clone(),
            address: self.address.clone(),
            key: self.key.clone(),
            version: self.version.clone(),
        }
    }

    /// Entities sorted by kind, the order inbound commands are matched in
    pub fn entities_by_kind(&self) -> Vec<&Entity> {
        let mut entities: Vec<&Entity> = self.entities.iter().collect();
        entities.sort_by_key(|e| e.kind());
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_is_redacted() {
        let key = Credential::new("0123456789abcdef");
        let identity = DeviceIdentity {
            id: "bf01".to_string(),
            address: "10.0.0.2".to_string(),
            key: key.clone(),
            version: "3.3".to_string(),
        };

        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("0123456789abcdef"), "{rendered}");
        assert!(rendered.contains("<redacted>"));
        assert_eq!(key.expose(), "0123456789abcdef");
    }
}
