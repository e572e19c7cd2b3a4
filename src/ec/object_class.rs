//! Object Classes
//!
//! An object class names the erasure-coding layout of an object: how many
//! data shards its bytes are split into and how many parity shards protect
//! them. Classes are written as `EC_<d>P<p>` with an optional group suffix
//! (`EC_2P1G1`, `EC_4P2GX`) and optional `OC_` prefix, or as `<d>+<p>`.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on `data_shards + parity_shards` for GF(2^8) Reed-Solomon.
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Erasure-coding layout of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectClass {
    data_shards: usize,
    parity_shards: usize,
}

impl ObjectClass {
    /// Create a class with `data_shards` data and `parity_shards` parity shards.
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidObjectClass {
            class: format!("{}+{}", data_shards, parity_shards),
            reason: reason.to_string(),
        };

        if data_shards == 0 {
            return Err(invalid("data_shards must be greater than 0"));
        }
        let total = data_shards
            .checked_add(parity_shards)
            .ok_or_else(|| invalid("total shards (data + parity) overflow"))?;
        if total > MAX_TOTAL_SHARDS {
            return Err(invalid("total shards must be at most 256"));
        }

        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Number of shard losses this class survives.
    pub fn fault_tolerance(&self) -> usize {
        self.parity_shards
    }

    /// Whether an object of this class can be placed on `targets` targets.
    pub fn fits(&self, targets: usize) -> bool {
        self.total_shards() <= targets
    }

    /// Whether `missing` lost shards can still be recovered.
    pub fn can_recover(&self, missing: usize) -> bool {
        missing <= self.parity_shards
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EC_{}P{}", self.data_shards, self.parity_shards)
    }
}

impl FromStr for ObjectClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let raw = s.trim();
        let invalid = |reason: &str| Error::InvalidObjectClass {
            class: raw.to_string(),
            reason: reason.to_string(),
        };

        if let Some((d, p)) = raw.split_once('+') {
            let d = d.trim().parse().map_err(|_| invalid("bad data shard count"))?;
            let p = p.trim().parse().map_err(|_| invalid("bad parity shard count"))?;
            return Self::new(d, p);
        }

        let upper = raw.to_ascii_uppercase();
        let body = upper.strip_prefix("OC_").unwrap_or(&upper);
        let body = body
            .strip_prefix("EC_")
            .ok_or_else(|| invalid("only EC object classes are supported"))?;

        let (data, rest) = body
            .split_once('P')
            .ok_or_else(|| invalid("expected <data>P<parity>"))?;
        let parity = match rest.split_once('G') {
            Some((parity, group)) => {
                if group != "X" && (group.is_empty() || !group.chars().all(|c| c.is_ascii_digit()))
                {
                    return Err(invalid("bad group suffix"));
                }
                parity
            }
            None => rest,
        };

        let data = data.parse().map_err(|_| invalid("bad data shard count"))?;
        let parity = parity.parse().map_err(|_| invalid("bad parity shard count"))?;
        Self::new(data, parity)
    }
}

impl TryFrom<String> for ObjectClass {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ObjectClass> for String {
    fn from(class: ObjectClass) -> Self {
        class.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_harness_names() {
        let class: ObjectClass = "OC_EC_2P1G1".parse().unwrap();
        assert_eq!(class.data_shards(), 2);
        assert_eq!(class.parity_shards(), 1);

        let class: ObjectClass = "EC_4P2GX".parse().unwrap();
        assert_eq!((class.data_shards(), class.parity_shards()), (4, 2));

        let class: ObjectClass = "ec_8p2".parse().unwrap();
        assert_eq!(class.total_shards(), 10);
    }

    #[test]
    fn test_parse_short_form() {
        let class: ObjectClass = "16 + 2".parse().unwrap();
        assert_eq!((class.data_shards(), class.parity_shards()), (16, 2));

        let class: ObjectClass = "3+0".parse().unwrap();
        assert_eq!(class.fault_tolerance(), 0);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_matches!(
            "RP_2G1".parse::<ObjectClass>(),
            Err(Error::InvalidObjectClass { .. })
        );
        assert!("EC_2X1".parse::<ObjectClass>().is_err());
        assert!("EC_2P1G".parse::<ObjectClass>().is_err());
        assert!("EC_0P2".parse::<ObjectClass>().is_err());
        assert!("200+100".parse::<ObjectClass>().is_err());
    }

    #[test]
    fn test_display_is_canonical() {
        let class: ObjectClass = "OC_EC_4P2G1".parse().unwrap();
        assert_eq!(class.to_string(), "EC_4P2");
        assert_eq!(class.to_string().parse::<ObjectClass>().unwrap(), class);
    }

    #[test]
    fn test_fits_and_recover() {
        let class = ObjectClass::new(2, 1).unwrap();
        assert!(class.fits(3));
        assert!(!class.fits(2));
        assert!(class.can_recover(1));
        assert!(!class.can_recover(2));
    }

    #[test]
    fn test_serde_as_string() {
        let class: ObjectClass = serde_yaml::from_str("OC_EC_2P1G1").unwrap();
        assert_eq!(class, ObjectClass::new(2, 1).unwrap());
        assert_eq!(serde_json::to_string(&class).unwrap(), "\"EC_2P1\"");
    }
}
