//! Raw device status as reported by the transport.

use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A device data point index ("dps"). Zero is not a valid address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(NonZeroU32);

impl Address {
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s
            .trim()
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", s, e))?;
        Self::new(value).ok_or_else(|| format!("invalid address '{}': must be non-zero", s))
    }
}

/// A single raw value reported by the device.
///
/// Tuya firmwares are inconsistent about types: some report numeric data
/// points as strings, so numeric accessors also parse text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl StatusValue {
    /// Truthiness used for on/off style fields.
    pub fn is_truthy(&self) -> bool {
        match self {
            StatusValue::Bool(b) => *b,
            StatusValue::Int(i) => *i != 0,
            StatusValue::Float(f) => *f != 0.0,
            StatusValue::Text(s) => !s.is_empty(),
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StatusValue::Bool(b) => Some(i64::from(*b)),
            StatusValue::Int(i) => Some(*i),
            StatusValue::Float(f) if f.is_finite() => Some(f.round() as i64),
            StatusValue::Float(_) => None,
            StatusValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl From<bool> for StatusValue {
    fn from(value: bool) -> Self {
        StatusValue::Bool(value)
    }
}

impl From<i32> for StatusValue {
    fn from(value: i32) -> Self {
        StatusValue::Int(i64::from(value))
    }
}

impl From<i64> for StatusValue {
    fn from(value: i64) -> Self {
        StatusValue::Int(value)
    }
}

impl From<&str> for StatusValue {
    fn from(value: &str) -> Self {
        StatusValue::Text(value.to_string())
    }
}

/// One point-in-time read of a device's data points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: BTreeMap<Address, StatusValue>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: Address, value: impl Into<StatusValue>) {
        self.values.insert(address, value.into());
    }

    pub fn get(&self, address: Address) -> Option<&StatusValue> {
        self.values.get(&address)
    }

    pub fn contains(&self, address: Address) -> bool {
        self.values.contains_key(&address)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Build a snapshot from the string-keyed map the device reports.
    ///
    /// Keys that are not valid addresses are dropped and returned so the
    /// caller can log them.
    pub fn from_dps(dps: BTreeMap<String, StatusValue>) -> (Self, Vec<String>) {
        let mut snapshot = Self::new();
        let mut rejected = Vec::new();

        for (key, value) in dps {
            match key.parse::<Address>() {
                Ok(address) => snapshot.insert(address, value),
                Err(_) => rejected.push(key),
            }
        }

        (snapshot, rejected)
    }
}

impl FromIterator<(Address, StatusValue)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (Address, StatusValue)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn addr(value: u32) -> Address {
    Address::new(value).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_rejects_zero() {
        assert_eq!(Address::new(0), None);
        assert!("0".parse::<Address>().is_err());
        assert_eq!("15".parse::<Address>().unwrap().get(), 15);
    }

    #[test]
    fn test_truthiness() {
        assert!(StatusValue::Bool(true).is_truthy());
        assert!(!StatusValue::Bool(false).is_truthy());
        assert!(StatusValue::Int(3).is_truthy());
        assert!(!StatusValue::Int(0).is_truthy());
        assert!(!StatusValue::Text(String::new()).is_truthy());
    }

    #[test]
    fn test_numeric_text() {
        assert_eq!(StatusValue::Text("3".to_string()).as_i64(), Some(3));
        assert_eq!(StatusValue::Text("high".to_string()).as_i64(), None);
    }

    #[test]
    fn test_from_dps_json() {
        let dps: BTreeMap<String, StatusValue> =
            serde_json::from_str(r#"{"1": true, "3": 600, "4": "2", "x": 1}"#).unwrap();
        let (snapshot, rejected) = Snapshot::from_dps(dps);

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(addr(1)), Some(&StatusValue::Bool(true)));
        assert_eq!(snapshot.get(addr(3)), Some(&StatusValue::Int(600)));
        assert_eq!(snapshot.get(addr(4)), Some(&StatusValue::Text("2".to_string())));
        assert_eq!(rejected, vec!["x".to_string()]);
    }
}
