//! Fractional order keys for the replicated section sequence.
//!
//! Keys are base-62 strings compared lexicographically. A new key is the
//! midpoint between its neighbours followed by a fixed-width suffix derived
//! from the inserting replica, so two replicas inserting into the same gap
//! concurrently still produce distinct keys, ordered deterministically.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::ClientId;

/// Base-62 digits in ascending byte order: '0' < '9' < 'A' < 'Z' < 'a' < 'z'.
pub const BASE62: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Width of the replica suffix; 61^11 exceeds the u64 range.
const SUFFIX_WIDTH: usize = 11;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderKey(String);

impl OrderKey {
    /// Validate a key received from a peer. Keys are non-empty base-62 strings
    /// that never end in '0' (a trailing zero would make two keys equal in value
    /// but different in bytes, leaving no room between them).
    pub fn parse(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.bytes().all(|b| digit(b).is_some())
            && !raw.ends_with('0');
        valid.then_some(Self(raw))
    }

    /// A key strictly between `prev` and `next`, unique to `client`.
    ///
    /// Missing neighbours mean the start or end of the sequence. If `next` does
    /// not sort after `prev` the key is placed right after `prev`.
    pub fn between(prev: Option<&OrderKey>, next: Option<&OrderKey>, client: ClientId) -> Self {
        let low = prev.map(|k| k.digits()).unwrap_or_default();
        let high = next.map(|k| k.digits()).filter(|high| *high > low);

        let mut out = midpoint(&low, high.as_deref());
        out.extend(client_suffix(client));
        Self(out.into_iter().map(|d| BASE62[d as usize] as char).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digits(&self) -> Vec<u8> {
        self.0.bytes().filter_map(digit).collect()
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'Z' => Some(byte - b'A' + 10),
        b'a'..=b'z' => Some(byte - b'a' + 36),
        _ => None,
    }
}

/// Digits strictly between `low` and `high` (or after `low` when unbounded).
///
/// Inputs carry no trailing zero digits. The result is never a prefix of `high`,
/// so any suffix appended to it still sorts below `high`, and it never ends in a
/// zero digit.
fn midpoint(low: &[u8], high: Option<&[u8]>) -> Vec<u8> {
    if let Some(high) = high {
        let shared = high
            .iter()
            .enumerate()
            .take_while(|(i, d)| low.get(*i).copied().unwrap_or(0) == **d)
            .count();
        if shared >= high.len() {
            return midpoint(low, None);
        }
        if shared > 0 {
            let mut out = high[..shared].to_vec();
            out.extend(midpoint(low.get(shared..).unwrap_or(&[]), Some(&high[shared..])));
            return out;
        }
    }

    let lo = low.first().copied().unwrap_or(0) as usize;
    let hi = high.and_then(|h| h.first()).map(|d| *d as usize).unwrap_or(62);

    if hi > lo + 1 {
        return vec![((lo + hi) / 2) as u8];
    }

    match high {
        Some(high) if high.len() > 1 => {
            let mut out = vec![high[0]];
            out.extend(midpoint(&[], Some(&high[1..])));
            out
        }
        _ => {
            let mut out = vec![lo as u8];
            out.extend(midpoint(low.get(1..).unwrap_or(&[]), None));
            out
        }
    }
}

/// Fixed-width base-61 rendering of the client id using digits 1..=61, so the
/// suffix never introduces a trailing zero.
fn client_suffix(client: ClientId) -> [u8; SUFFIX_WIDTH] {
    let mut out = [1_u8; SUFFIX_WIDTH];
    let mut rest = client.0;
    for slot in out.iter_mut().rev() {
        *slot = (rest % 61) as u8 + 1;
        rest /= 61;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prev: Option<&OrderKey>, next: Option<&OrderKey>, client: u64) -> OrderKey {
        OrderKey::between(prev, next, ClientId(client))
    }

    #[test]
    fn keys_fall_strictly_between_neighbours() {
        let first = key(None, None, 1);
        let last = key(Some(&first), None, 1);
        let middle = key(Some(&first), Some(&last), 1);
        assert!(first < middle && middle < last, "{first} {middle} {last}");

        let before = key(None, Some(&first), 1);
        assert!(before < first);
    }

    #[test]
    fn concurrent_inserts_into_same_gap_are_distinct_and_bounded() {
        let left = key(None, None, 7);
        let right = key(Some(&left), None, 7);

        let from_a = key(Some(&left), Some(&right), 100);
        let from_b = key(Some(&left), Some(&right), 200);

        assert_ne!(from_a, from_b);
        for k in [&from_a, &from_b] {
            assert!(left < *k && *k < right, "{left} < {k} < {right}");
        }
    }

    #[test]
    fn repeated_splitting_never_escapes_the_gap() {
        let left = key(None, None, 3);
        let mut right = key(Some(&left), None, 3);
        for _ in 0..200 {
            let next = key(Some(&left), Some(&right), 3);
            assert!(left < next && next < right);
            right = next;
        }
    }

    #[test]
    fn generated_keys_parse_and_bad_keys_do_not() {
        let k = key(None, None, u64::MAX);
        assert_eq!(OrderKey::parse(k.as_str()), Some(k.clone()));
        assert!(!k.as_str().ends_with('0'));
        assert!(OrderKey::parse("").is_none());
        assert!(OrderKey::parse("V0").is_none());
        assert!(OrderKey::parse("a-b").is_none());
    }

    #[test]
    fn inverted_neighbours_place_key_after_prev() {
        let low = key(None, None, 1);
        let high = key(Some(&low), None, 1);
        let k = key(Some(&high), Some(&low), 2);
        assert!(k > high);
    }
}
