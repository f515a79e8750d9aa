//! 64-bit radio node addresses.
//!
//! Addresses travel through the broker as part of routing keys, so their
//! textual form is fixed: eight lowercase hex octets separated by colons,
//! e.g. `00:13:a2:00:40:32:dc:dc`. Parsing accepts either case.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A 64-bit (IEEE extended) radio address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; 8]);

impl Address {
    /// The broadcast address (`00:00:00:00:00:00:ff:ff`).
    pub const BROADCAST: Address = Address([0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);

    /// The coordinator address (all zeros).
    pub const COORDINATOR: Address = Address([0; 8]);

    /// Construct an address from its big-endian bytes.
    pub const fn new(bytes: [u8; 8]) -> Self {
        Address(bytes)
    }

    /// Construct an address from a `u64`.
    pub const fn from_u64(value: u64) -> Self {
        Address(value.to_be_bytes())
    }

    /// The address as big-endian bytes, as sent on the radio.
    pub const fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// The address as a `u64`.
    pub const fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl From<[u8; 8]> for Address {
    fn from(bytes: [u8; 8]) -> Self {
        Address(bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Error returned when parsing an [`Address`] from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid radio address: {}", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

impl FromStr for Address {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        let mut count = 0;

        for part in s.split(':') {
            if count == 8 || part.len() != 2 {
                return Err(ParseAddressError(s.to_string()));
            }
            bytes[count] =
                u8::from_str_radix(part, 16).map_err(|_| ParseAddressError(s.to_string()))?;
            count += 1;
        }

        if count != 8 {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(Address(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
