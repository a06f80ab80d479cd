//! Bundle identifiers.
//!
//! A BID is an opaque, totally-ordered token of the form
//! `tttttttt-tttt-rrrr-rrrr-rrrrrrrrrrrr`: the first two groups are a
//! 48-bit millisecond timestamp, the remaining groups are 80 random bits.
//! String order equals creation-time order to millisecond resolution, which
//! is what makes BIDs usable as queue key suffixes and directory names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// A bundle identifier. Minted once per bundle, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bid {
    /// Milliseconds since the Unix epoch, truncated to 48 bits.
    millis: u64,
    /// Random suffix.
    random: [u8; 10],
}

impl Bid {
    /// Mint a new BID with the current timestamp and a random suffix.
    #[must_use]
    pub fn mint() -> Self {
        #[allow(clippy::cast_sign_loss)]
        let millis = (chrono::Utc::now().timestamp_millis() as u64) & 0xFFFF_FFFF_FFFF;
        // UUID v4 gives 122 random bits from the OS CSPRNG; take ten bytes.
        let uuid = uuid::Uuid::new_v4();
        let mut random = [0u8; 10];
        random.copy_from_slice(&uuid.as_bytes()[..10]);
        Self { millis, random }
    }

    /// The timestamp prefix in milliseconds since the Unix epoch.
    #[must_use]
    pub fn timestamp_millis(&self) -> u64 {
        self.millis
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hi = (self.millis >> 16) & 0xFFFF_FFFF;
        let lo = self.millis & 0xFFFF;
        let r = &self.random;
        write!(
            f,
            "{hi:08x}-{lo:04x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            r[0], r[1], r[2], r[3], r[4], r[5], r[6], r[7], r[8], r[9]
        )
    }
}

impl FromStr for Bid {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::BundleRef {
            reason: format!("malformed bid '{s}': {reason}"),
        };

        let groups: Vec<&str> = s.split('-').collect();
        let [g0, g1, g2, g3, g4] = groups.as_slice() else {
            return Err(invalid("expected five '-'-separated groups"));
        };
        if g0.len() != 8 || g1.len() != 4 || g2.len() != 4 || g3.len() != 4 || g4.len() != 12 {
            return Err(invalid("bad group lengths"));
        }

        let hi = u64::from_str_radix(g0, 16).map_err(|_| invalid("bad timestamp"))?;
        let lo = u64::from_str_radix(g1, 16).map_err(|_| invalid("bad timestamp"))?;
        let millis = (hi << 16) | lo;

        let hex: String = [*g2, *g3, *g4].concat();
        let mut random = [0u8; 10];
        for (i, byte) in random.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| invalid("bad random suffix"))?;
        }

        Ok(Self { millis, random })
    }
}

impl Serialize for Bid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Bid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_shape() {
        let bid = Bid::mint();
        let s = bid.to_string();
        let groups: Vec<&str> = s.split('-').collect();
        assert_eq!(groups.len(), 5);
        assert_eq!(groups[0].len(), 8);
        assert_eq!(groups[1].len(), 4);
        assert_eq!(groups[2].len(), 4);
        assert_eq!(groups[3].len(), 4);
        assert_eq!(groups[4].len(), 12);
    }

    #[test]
    fn parse_format_roundtrip() {
        let bid = Bid::mint();
        let parsed: Bid = bid.to_string().parse().unwrap();
        assert_eq!(parsed, bid);
    }

    #[test]
    fn ordering_follows_timestamp() {
        let early = Bid {
            millis: 1_700_000_000_000,
            random: [0xFF; 10],
        };
        let late = Bid {
            millis: 1_700_000_000_001,
            random: [0x00; 10],
        };
        assert!(early < late);
        // String order agrees with value order.
        assert!(early.to_string() < late.to_string());
    }

    #[test]
    fn minted_bids_are_unique() {
        let a = Bid::mint();
        let b = Bid::mint();
        assert_ne!(a, b);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("not-a-bid".parse::<Bid>().is_err());
        assert!("00000000-0000-0000-0000".parse::<Bid>().is_err());
        assert!("zzzzzzzz-0000-0000-0000-000000000000".parse::<Bid>().is_err());
    }

    #[test]
    fn serde_roundtrip_as_string() {
        let bid = Bid::mint();
        let json = serde_json::to_string(&bid).unwrap();
        assert_eq!(json, format!("\"{bid}\""));
        let back: Bid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, bid);
    }
}
