use std::fmt;
use std::str::FromStr;

/// Identifier of a log entry: `<milliseconds>-<sequence>`.
///
/// Ids are totally ordered by `(ms, seq)`. A bare `<milliseconds>` is accepted
/// on input and means sequence 0, so `"5"` and `"5-0"` name the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    /// Position before the first entry of any log.
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id that follows `self` within the same millisecond.
    pub fn successor(&self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms.saturating_add(1),
                seq: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEntryIdError(String);

impl fmt::Display for ParseEntryIdError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid log entry id: {:?}", self.0)
    }
}

impl std::error::Error for ParseEntryIdError {}

impl FromStr for EntryId {
    type Err = ParseEntryIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseEntryIdError(s.to_string());
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, Some(seq)),
            None => (s, None),
        };

        let ms = ms.parse::<u64>().map_err(|_| invalid())?;
        let seq = match seq {
            Some(seq) => seq.parse::<u64>().map_err(|_| invalid())?,
            None => 0,
        };

        Ok(EntryId { ms, seq })
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_and_bare_ids() {
        assert_eq!("1700000000000-3".parse(), Ok(EntryId::new(1700000000000, 3)));
        assert_eq!("5".parse(), Ok(EntryId::new(5, 0)));
        assert_eq!("0".parse(), Ok(EntryId::ZERO));
    }

    #[test]
    fn rejects_malformed_ids() {
        for bad in ["", "-", "abc", "1-", "-1", "1-2-3", "1.5", " 1"] {
            assert!(bad.parse::<EntryId>().is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn orders_by_milliseconds_then_sequence() {
        let a = EntryId::new(1, 9);
        let b = EntryId::new(2, 0);
        let c = EntryId::new(2, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn displays_in_broker_format() {
        assert_eq!(EntryId::new(12, 7).to_string(), "12-7");
        assert_eq!("12".parse::<EntryId>().unwrap().to_string(), "12-0");
    }

    #[test]
    fn successor_rolls_over_sequence() {
        assert_eq!(EntryId::new(3, 1).successor(), EntryId::new(3, 2));
        assert_eq!(EntryId::new(3, u64::MAX).successor(), EntryId::new(4, 0));
    }
}
