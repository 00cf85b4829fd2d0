//! Node capacity annotations published by the device agent and consumed by
//! the scheduler plugin and the inspect API.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Value of the `<domain>/<type>-shared-capacity` annotation:
/// `{"0": 6, "1": 6}` keyed by card minor.
pub type SharedCapacity = BTreeMap<String, i64>;

/// One card entry of the DRS capacity annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrsDeviceSpec {
    pub index: String,
    pub minor: String,
    pub capacity: i64,
}

/// Value of the `<domain>/<type>-drs-capacity` annotation. The profile table
/// is assumed uniform across all cards of the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrsCapacity {
    pub devices: Vec<DrsDeviceSpec>,
    pub profiles: BTreeMap<String, String>,
}

impl DrsCapacity {
    /// `{minor: capacity}` view of the device list.
    pub fn capacity_by_minor(&self) -> BTreeMap<String, i64> {
        self.devices
            .iter()
            .map(|d| (d.minor.clone(), d.capacity))
            .collect()
    }

    /// Hardware CLI index for a minor, if the card is known.
    pub fn index_of(&self, minor: &str) -> Option<&str> {
        self.devices
            .iter()
            .find(|d| d.minor == minor)
            .map(|d| d.index.as_str())
    }
}

/// Parses the integer slice weight out of a profile name such as `3g.24gb`.
pub fn profile_weight(profile_name: &str) -> Option<i64> {
    profile_name.split('g').next()?.parse().ok()
}

/// The `<k>g` prefix of a profile name, the key containers are matched by.
pub fn profile_prefix(profile_name: &str) -> Option<String> {
    let weight = profile_weight(profile_name)?;
    Some(format!("{weight}g"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drs_capacity_round_trips_through_json() {
        let capacity = DrsCapacity {
            devices: vec![DrsDeviceSpec {
                index: "0".to_string(),
                minor: "0".to_string(),
                capacity: 6,
            }],
            profiles: BTreeMap::from([("1g.8gb".to_string(), "id1".to_string())]),
        };
        let json = serde_json::to_string(&capacity).unwrap();
        let parsed: DrsCapacity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, capacity);
        assert_eq!(parsed.capacity_by_minor().get("0"), Some(&6));
        assert_eq!(parsed.index_of("0"), Some("0"));
        assert_eq!(parsed.index_of("1"), None);
    }

    #[test]
    fn profile_weight_parses_the_leading_digits() {
        assert_eq!(profile_weight("1g.8gb"), Some(1));
        assert_eq!(profile_weight("3g.24gb"), Some(3));
        assert_eq!(profile_weight("6g.48gb"), Some(6));
        assert_eq!(profile_weight("gibberish"), None);
        assert_eq!(profile_prefix("3g.24gb").as_deref(), Some("3g"));
    }
}
