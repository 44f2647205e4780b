//! Byte size values such as "1gb" or "500mb"

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A size in bytes written with a unit suffix: `b`, `kb`, `mb`, `gb`, `tb`, `pb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(u64);

const UNITS: [(&str, u64); 6] = [
    ("pb", 1 << 50),
    ("tb", 1 << 40),
    ("gb", 1 << 30),
    ("mb", 1 << 20),
    ("kb", 1 << 10),
    ("b", 1),
];

impl ByteSize {
    pub const fn bytes(n: u64) -> Self {
        Self(n)
    }

    pub const fn kb(n: u64) -> Self {
        Self(n << 10)
    }

    pub const fn mb(n: u64) -> Self {
        Self(n << 20)
    }

    pub const fn gb(n: u64) -> Self {
        Self(n << 30)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let split = lower
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("Missing size unit in '{}'", s))?;
        let (digits, unit) = lower.split_at(split);
        if digits.is_empty() {
            return Err(format!("Missing amount in '{}'", s));
        }
        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("Invalid amount in '{}'", s))?;
        let multiplier = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, m)| *m)
            .ok_or_else(|| format!("Unknown size unit '{}' in '{}'", unit, s))?;

        amount
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| format!("Size '{}' is too large", s))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0b");
        }
        for (unit, size) in UNITS {
            if self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, unit);
            }
        }
        write!(f, "{}b", self.0)
    }
}

impl Serialize for ByteSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sizes() {
        assert_eq!("1gb".parse::<ByteSize>().unwrap(), ByteSize::gb(1));
        assert_eq!("500MB".parse::<ByteSize>().unwrap(), ByteSize::mb(500));
        assert_eq!("10b".parse::<ByteSize>().unwrap(), ByteSize::bytes(10));
        assert!("10".parse::<ByteSize>().is_err());
        assert!("10xb".parse::<ByteSize>().is_err());
    }

    #[test]
    fn display_picks_largest_exact_unit() {
        assert_eq!(ByteSize::gb(2).to_string(), "2gb");
        assert_eq!(ByteSize::mb(1536).to_string(), "1536mb");
        assert_eq!(ByteSize::bytes(1000).to_string(), "1000b");
    }
}
