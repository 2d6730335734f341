//! Human-readable byte sizes for read chunk settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid size format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),
}

const UNITS: &[(&str, u64)] = &[("B", 1), ("KB", 1024), ("MB", 1024 * 1024)];

/// Byte count that parses from `"8KB"`, `"1M"` or a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub const fn kib(n: u64) -> Self {
        ByteSize(n * 1024)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Size as a buffer length, saturating on 32-bit targets.
    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte size as string (e.g., \"8KB\") or integer")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(ByteSize(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("negative byte size: {v}")))
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                v.parse::<ByteSize>().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_uppercase();

        if let Ok(num) = s.parse::<u64>() {
            return Ok(ByteSize(num));
        }

        let Some(pos) = s.find(|c: char| !c.is_ascii_digit()) else {
            return Err(ParseError::InvalidFormat(s));
        };
        let (num_str, unit) = s.split_at(pos);
        if num_str.is_empty() {
            return Err(ParseError::InvalidFormat(s.clone()));
        }
        let num: u64 = num_str.parse()?;

        let multiplier = match unit.trim() {
            "B" => 1,
            "K" | "KB" | "KIB" => 1024,
            "M" | "MB" | "MIB" => 1024 * 1024,
            other => return Err(ParseError::InvalidUnit(other.to_string())),
        };

        num.checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ParseError::InvalidFormat(s.clone()))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &(unit, divisor) in UNITS.iter().rev() {
            if self.0 >= divisor && self.0 % divisor == 0 {
                return write!(f, "{}{}", self.0 / divisor, unit);
            }
        }
        write!(f, "{}B", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!("512".parse::<ByteSize>().unwrap().as_u64(), 512);
        assert_eq!("8KB".parse::<ByteSize>().unwrap().as_u64(), 8 * 1024);
        assert_eq!("8k".parse::<ByteSize>().unwrap().as_u64(), 8 * 1024);
        assert_eq!("1MiB".parse::<ByteSize>().unwrap().as_u64(), 1024 * 1024);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            "KB".parse::<ByteSize>(),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            "3GB".parse::<ByteSize>(),
            Err(ParseError::InvalidUnit(_))
        ));
    }

    #[test]
    fn test_parse_rejects_overflow() {
        assert!(matches!(
            "99999999999999M".parse::<ByteSize>(),
            Err(ParseError::InvalidFormat(_))
        ));
        assert_eq!(
            "18014398509481983KB".parse::<ByteSize>().unwrap().as_u64(),
            18014398509481983 * 1024
        );
    }

    #[test]
    fn test_display_picks_largest_exact_unit() {
        assert_eq!(ByteSize::kib(8).to_string(), "8KB");
        assert_eq!(ByteSize(1536).to_string(), "1536B");
        assert_eq!(ByteSize(2 * 1024 * 1024).to_string(), "2MB");
    }

    #[test]
    fn test_deserialize_string_and_number() {
        #[derive(Deserialize)]
        struct Chunk {
            size: ByteSize,
        }
        let parsed: Chunk = serde_json::from_str(r#"{"size": "16KB"}"#).unwrap();
        assert_eq!(parsed.size, ByteSize::kib(16));
        let parsed: Chunk = serde_json::from_str(r#"{"size": 4096}"#).unwrap();
        assert_eq!(parsed.size.as_usize(), 4096);
    }
}
