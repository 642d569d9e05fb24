use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

/// A published build stamp of the strict form `YYYYMMDD.N`.
///
/// Ordering is by date then sequence, which is what makes "newest build"
/// well defined across publishing days.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BuildVersion {
    date: u32,
    seq: u32,
}

#[derive(Debug, Error)]
#[error("invalid build version \"{0}\"")]
pub struct InvalidVersion(String);

impl FromStr for BuildVersion {
    type Err = InvalidVersion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidVersion(s.to_owned());
        let trimmed = s.trim();

        let (date, seq) = trimmed.split_once('.').ok_or_else(invalid)?;
        if date.len() != 8 || !date.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        Ok(Self {
            date: date.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

impl BuildVersion {
    /// Lenient parse: anything that is not a well-formed stamp orders
    /// below every real build instead of failing the comparison
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self { date: 0, seq: 0 })
    }
}

impl Display for BuildVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08}.{}", self.date, self.seq)
    }
}
