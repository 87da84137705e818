//! Stream sequence tracking primitives.
//!
//! Sequences arrive as decimal strings because they may exceed 2^53; all
//! comparisons and increments go through an arbitrary-precision integer and
//! never touch floating point.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use num_traits::ToPrimitive;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Position of an event within a logical stream.
///
/// Ordered, hashable, and cheap to increment. `Sequence::zero()` means "no
/// event applied yet".
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence(BigUint);

impl Sequence {
    /// The initial cursor value, before any event has been applied.
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    pub fn from_u64(value: u64) -> Self {
        Self(BigUint::from(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == BigUint::default()
    }

    /// The sequence immediately following this one.
    pub fn next(&self) -> Self {
        Self(&self.0 + 1u32)
    }

    /// Parse a decimal-string sequence. Rejects signs, whitespace, and
    /// anything that is not a plain run of ASCII digits.
    pub fn parse(input: &str) -> Option<Self> {
        if input.is_empty() || !input.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        BigUint::from_str(input).ok().map(Self)
    }

    /// Lossy view for wire fields typed as plain integers. Saturates at
    /// `u64::MAX`, far beyond any sequence a live stream reaches.
    pub fn to_u64_saturating(&self) -> u64 {
        self.0.to_u64().unwrap_or(u64::MAX)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Sequence {
    fn from(value: u64) -> Self {
        Self::from_u64(value)
    }
}

impl Serialize for Sequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Sequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SequenceVisitor;

        impl Visitor<'_> for SequenceVisitor {
            type Value = Sequence;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a decimal-string or unsigned-integer sequence")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Sequence::parse(value)
                    .ok_or_else(|| E::custom(format!("invalid sequence: {value:?}")))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Sequence::from_u64(value))
            }
        }

        deserializer.deserialize_any(SequenceVisitor)
    }
}

/// Insertion-ordered set of recently seen event ids with oldest-first
/// eviction once the cap is exceeded.
#[derive(Debug)]
pub struct BoundedIdSet {
    order: VecDeque<String>,
    set: HashSet<String>,
    cap: usize,
}

impl BoundedIdSet {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            cap,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.contains(id)
    }

    /// Insert an id, evicting from the oldest end until the set fits the cap
    /// again. Re-inserting a known id is a no-op.
    pub fn insert(&mut self, id: &str) {
        if !self.set.insert(id.to_owned()) {
            return;
        }
        self.order.push_back(id.to_owned());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Per-stream sequence metadata: the applied cursor plus the dedup window.
#[derive(Debug)]
pub struct SeqMeta {
    pub last_seq: Sequence,
    pub seen_ids: BoundedIdSet,
}

impl SeqMeta {
    pub fn new(seen_cap: usize) -> Self {
        Self {
            last_seq: Sequence::zero(),
            seen_ids: BoundedIdSet::new(seen_cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_plain_digit_runs_only() {
        assert_eq!(Sequence::parse("42"), Some(Sequence::from_u64(42)));
        assert_eq!(Sequence::parse("0"), Some(Sequence::zero()));
        assert!(Sequence::parse("").is_none());
        assert!(Sequence::parse("-1").is_none());
        assert!(Sequence::parse("+1").is_none());
        assert!(Sequence::parse("1.5").is_none());
        assert!(Sequence::parse(" 7").is_none());
    }

    #[test]
    fn sequences_beyond_f64_precision_stay_exact() {
        // 2^53 + 1 is the first integer a double cannot represent.
        let a = Sequence::parse("9007199254740993").unwrap();
        let b = Sequence::parse("9007199254740992").unwrap();
        assert!(b < a);
        assert_eq!(b.next(), a);
        assert_eq!(a.to_string(), "9007199254740993");
    }

    #[test]
    fn deserializes_from_string_and_integer() {
        let from_str: Sequence = serde_json::from_str("\"101\"").unwrap();
        let from_int: Sequence = serde_json::from_str("101").unwrap();
        assert_eq!(from_str, from_int);
        assert_eq!(serde_json::to_string(&from_str).unwrap(), "\"101\"");
    }

    #[test]
    fn bounded_id_set_evicts_oldest_first() {
        let mut set = BoundedIdSet::new(3);
        for id in ["a", "b", "c", "d"] {
            set.insert(id);
        }
        assert_eq!(set.len(), 3);
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("d"));
    }

    #[test]
    fn bounded_id_set_reinsert_is_noop() {
        let mut set = BoundedIdSet::new(2);
        set.insert("a");
        set.insert("a");
        assert_eq!(set.len(), 1);
    }
}
