use crate::error::ModelError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Default WAL segment size (16MB) used when the source does not report one.
pub const DEFAULT_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// A log sequence number: a 64-bit byte offset into the source's WAL.
///
/// Textually rendered as two 32-bit hexadecimal halves separated by a slash,
/// the same form the server prints for `pg_lsn` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid (zero) position. Used to mean "unset" in the sentinel.
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Ordinal of the WAL segment containing this position.
    pub fn segment_number(&self, wal_segment_size: u64) -> u64 {
        self.0 / wal_segment_size
    }

    /// WAL segment filename for this position, the 24-hex-digit name the
    /// server uses on disk. Segment files partition the CDC subtree.
    pub fn segment_name(&self, timeline: u32, wal_segment_size: u64) -> String {
        let segments_per_id = 0x1_0000_0000_u64 / wal_segment_size;
        let segno = self.segment_number(wal_segment_size);
        format!(
            "{:08X}{:08X}{:08X}",
            timeline,
            (segno / segments_per_id) as u32,
            (segno % segments_per_id) as u32
        )
    }

}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidLsn(s.to_string()))?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| ModelError::InvalidLsn(s.to_string()))?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| ModelError::InvalidLsn(s.to_string()))?;
        if hi > u32::MAX as u64 || lo > u32::MAX as u64 {
            return Err(ModelError::InvalidLsn(s.to_string()));
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

impl From<u64> for Lsn {
    fn from(val: u64) -> Self {
        Lsn(val)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_formats_round_trip() {
        let lsn: Lsn = "1/16B6C50".parse().unwrap();
        assert_eq!(lsn.0, 0x1_16B6C50);
        assert_eq!(lsn.to_string(), "1/16B6C50");

        let zero: Lsn = "0/0".parse().unwrap();
        assert_eq!(zero, Lsn::INVALID);
        assert!(!zero.is_valid());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16B6C50".parse::<Lsn>().is_err());
        assert!("0/zzz".parse::<Lsn>().is_err());
        assert!("100000000/0".parse::<Lsn>().is_err());
    }

    #[test]
    fn ordering_follows_byte_offset() {
        let a: Lsn = "0/1000".parse().unwrap();
        let b: Lsn = "0/2000".parse().unwrap();
        let c: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn segment_name_matches_server_layout() {
        // 16MB segments: 0/2000028 falls in segment 2 of timeline 1.
        let lsn: Lsn = "0/2000028".parse().unwrap();
        assert_eq!(
            lsn.segment_name(1, DEFAULT_WAL_SEGMENT_SIZE),
            "000000010000000000000002"
        );

        // High half of the LSN becomes the middle name component.
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(
            lsn.segment_name(1, DEFAULT_WAL_SEGMENT_SIZE),
            "0000000100000016000000B3"
        );
    }

    #[test]
    fn serde_uses_textual_form() {
        let lsn: Lsn = "A/5".parse().unwrap();
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, "\"A/5\"");
        let back: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lsn);
    }
}
