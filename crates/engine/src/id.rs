//! Monotonic migration identifiers
//!
//! An id is 128 bits rendered as 26 Crockford base32 characters: 48 bits of
//! milliseconds since the Unix epoch followed by 80 random bits. Ids sort
//! lexicographically in creation order, and ids generated within the same
//! millisecond by one process keep increasing.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use std::fmt;
use std::sync::Mutex;

/// Length of an encoded id
pub const ID_LEN: usize = 26;

const ENCODING: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const RANDOM_BITS: u32 = 80;
const RANDOM_MASK: u128 = (1u128 << RANDOM_BITS) - 1;
const MAX_TIMESTAMP: u64 = (1u64 << 48) - 1;

static GENERATOR: Lazy<Mutex<IdGenerator>> = Lazy::new(|| Mutex::new(IdGenerator::new()));

/// A validated, sortable migration identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationId(String);

impl MigrationId {
    /// Generate a fresh id from the process-wide monotonic generator
    pub fn generate() -> Self {
        let timestamp = Utc::now().timestamp_millis().max(0) as u64;
        let mut generator = GENERATOR.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        generator.next_at(timestamp, &mut rand::thread_rng())
    }

    /// Encode a timestamp and random component
    pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
        let timestamp = u128::from(timestamp_ms.min(MAX_TIMESTAMP));
        let value = (timestamp << RANDOM_BITS) | (random & RANDOM_MASK);
        let encoded = (0..ID_LEN)
            .map(|i| {
                let shift = 5 * (ID_LEN - 1 - i);
                ENCODING[((value >> shift) & 0x1f) as usize] as char
            })
            .collect();
        Self(encoded)
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::is_valid(value).then(|| Self(value.to_string()))
    }

    /// True when `value` is 26 upper-case Crockford characters that fit in 128 bits
    pub fn is_valid(value: &str) -> bool {
        value.len() == ID_LEN
            && value.bytes().all(|b| ENCODING.contains(&b))
            && value.as_bytes()[0] <= b'7'
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Millisecond timestamp encoded in the first ten characters
    pub fn timestamp_ms(&self) -> u64 {
        self.0.bytes().take(10).fold(0u64, |acc, b| {
            let digit = ENCODING.iter().position(|&c| c == b).unwrap_or(0) as u64;
            (acc << 5) | digit
        })
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.timestamp_ms() as i64).single()
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MigrationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Stateful generator guaranteeing strictly increasing ids
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Option<(u64, u128)>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id for the given clock reading.
    ///
    /// A reading at or behind the previous one reuses the previous timestamp
    /// and increments the random part, so ids never go backwards.
    pub fn next_at<R: Rng>(&mut self, timestamp_ms: u64, rng: &mut R) -> MigrationId {
        let timestamp_ms = timestamp_ms.min(MAX_TIMESTAMP);
        let (timestamp, random) = match self.last {
            Some((last_ts, last_random)) if timestamp_ms <= last_ts => {
                if last_random < RANDOM_MASK {
                    (last_ts, last_random + 1)
                } else {
                    (last_ts + 1, rng.gen::<u128>() & RANDOM_MASK)
                }
            }
            _ => (timestamp_ms, rng.gen::<u128>() & RANDOM_MASK),
        };

        self.last = Some((timestamp, random));
        MigrationId::from_parts(timestamp, random)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_encoding_bounds() {
        assert_eq!(MigrationId::from_parts(0, 0).as_str(), "0".repeat(ID_LEN));
        assert_eq!(
            MigrationId::from_parts(MAX_TIMESTAMP, RANDOM_MASK).as_str(),
            "7ZZZZZZZZZZZZZZZZZZZZZZZZZ"
        );
    }

    #[test]
    fn test_timestamp_round_trip() {
        let id = MigrationId::from_parts(1_469_918_176_385, 42);
        assert_eq!(&id.as_str()[..10], "01ARYZ6S41");
        assert_eq!(id.timestamp_ms(), 1_469_918_176_385);
        assert_eq!(
            id.created_at().unwrap().timestamp_millis(),
            1_469_918_176_385
        );
    }

    #[test]
    fn test_validation() {
        assert!(MigrationId::is_valid("01ARZ3NDEKTSV4RRFFQ69G5FAV"));
        assert!(!MigrationId::is_valid("01ARZ3NDEKTSV4RRFFQ69G5FA"));
        assert!(!MigrationId::is_valid("01arz3ndektsv4rrffq69g5fav"));
        assert!(!MigrationId::is_valid("01ARZ3NDEKTSV4RRFFQ69G5FAU"));
        assert!(!MigrationId::is_valid("81ARZ3NDEKTSV4RRFFQ69G5FAV"));
        assert!(MigrationId::parse("not an id").is_none());
    }

    #[test]
    fn test_generated_ids_are_strictly_increasing() {
        let mut previous = MigrationId::generate();
        for _ in 0..1000 {
            let next = MigrationId::generate();
            assert!(MigrationId::is_valid(next.as_str()));
            assert!(next > previous, "{} should sort after {}", next, previous);
            previous = next;
        }
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut generator = IdGenerator::new();

        let first = generator.next_at(1_700_000_000_000, &mut rng);
        let same_ms = generator.next_at(1_700_000_000_000, &mut rng);
        let earlier = generator.next_at(1_600_000_000_000, &mut rng);
        let later = generator.next_at(1_700_000_000_001, &mut rng);

        assert!(same_ms > first);
        assert!(earlier > same_ms);
        assert_eq!(earlier.timestamp_ms(), 1_700_000_000_000);
        assert!(later > earlier);
    }
}
