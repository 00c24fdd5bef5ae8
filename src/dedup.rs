//! Key deduplication.
//!
//! Items are keyed by the text sample that produced them. For causal variants,
//! two items whose keys agree on the first `t + 1` characters have identical
//! vectors at position `t`, so a scan at that position only needs one
//! representative per distinct prefix. [`DedupMap`] records, for each distinct
//! prefix, the smallest global index that produced it.

use std::collections::{HashMap, HashSet};

use crate::error::{Result, SeekError};

/// Distinct keys in order of first appearance.
pub fn unique_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for key in keys {
        let key = key.as_ref();
        if seen.insert(key.to_owned()) {
            out.push(key.to_owned());
        }
    }
    out
}

/// Like [`unique_keys`], for callers that need at least one key.
pub fn unique_keys_nonempty<I, S>(keys: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let out = unique_keys(keys);
    if out.is_empty() {
        return Err(SeekError::InvalidArgument("at least one key is required".into()));
    }
    Ok(out)
}

/// Every distinct window of `len` characters of `text`, in first-occurrence order.
pub fn unique_substrings(text: &str, len: usize) -> Result<Vec<String>> {
    if len == 0 {
        return Err(SeekError::InvalidArgument("substring length must be >= 1".into()));
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < len {
        return Err(SeekError::InvalidArgument(format!(
            "text length {} is shorter than substring length {}",
            chars.len(),
            len
        )));
    }
    Ok(unique_keys(
        chars.windows(len).map(|w| w.iter().collect::<String>()),
    ))
}

/// First `n` characters of `key`, or `None` if the key is shorter.
pub(crate) fn char_prefix(key: &str, n: usize) -> Option<&str> {
    if n == 0 {
        return Some("");
    }
    match key.char_indices().nth(n) {
        Some((byte, _)) => Some(&key[..byte]),
        None if key.chars().count() == n => Some(key),
        None => None,
    }
}

/// Map from prefix to the smallest global index whose key has that prefix,
/// kept in first-occurrence (and therefore ascending index) order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupMap {
    prefix_len: usize,
    entries: Vec<(String, usize)>,
    lookup: HashMap<String, usize>,
}

/// Builds the first-occurrence map for `prefix_len`-character prefixes.
pub fn first_occurrence_map<S: AsRef<str>>(keys: &[S], prefix_len: usize) -> Result<DedupMap> {
    DedupMap::build(keys, prefix_len)
}

impl DedupMap {
    pub fn build<S: AsRef<str>>(keys: &[S], prefix_len: usize) -> Result<Self> {
        let mut entries = Vec::new();
        let mut lookup = HashMap::new();
        for (idx, key) in keys.iter().enumerate() {
            let key = key.as_ref();
            let prefix = char_prefix(key, prefix_len).ok_or_else(|| SeekError::PrefixTooLong {
                key: key.to_owned(),
                key_len: key.chars().count(),
                prefix_len,
            })?;
            if !lookup.contains_key(prefix) {
                lookup.insert(prefix.to_owned(), entries.len());
                entries.push((prefix.to_owned(), idx));
            }
        }
        Ok(Self { prefix_len, entries, lookup })
    }

    /// Map for sequence position `t`, i.e. prefixes of length `t + 1`.
    pub fn for_position<S: AsRef<str>>(keys: &[S], t: usize) -> Result<Self> {
        Self::build(keys, t + 1)
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Smallest global index with this prefix.
    pub fn get(&self, prefix: &str) -> Option<usize> {
        self.lookup.get(prefix).map(|&pos| self.entries[pos].1)
    }

    /// Representative `(prefix, global_index)` at position `pos` of the map.
    pub fn entry(&self, pos: usize) -> Option<(&str, usize)> {
        self.entries.get(pos).map(|(p, i)| (p.as_str(), *i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.entries.iter().map(|(p, i)| (p.as_str(), *i))
    }

    /// Global indices of the representatives, ascending.
    pub fn global_indices(&self) -> Vec<usize> {
        self.entries.iter().map(|(_, i)| *i).collect()
    }

    /// All global indices whose key shares `prefix`, i.e. the full
    /// equivalence class behind one representative.
    pub fn members<S: AsRef<str>>(&self, keys: &[S], prefix: &str) -> Vec<usize> {
        if !self.lookup.contains_key(prefix) {
            return Vec::new();
        }
        keys.iter()
            .enumerate()
            .filter(|(_, k)| char_prefix(k.as_ref(), self.prefix_len) == Some(prefix))
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unique_keys_keeps_first_occurrence_order() {
        assert_eq!(unique_keys(["ab", "ba", "ab", "cc"]), vec!["ab", "ba", "cc"]);
    }

    #[test]
    fn nonempty_variant_rejects_empty_input() {
        let empty: [&str; 0] = [];
        assert!(unique_keys(empty).is_empty());
        assert!(unique_keys_nonempty(empty).is_err());
    }

    #[test]
    fn substrings_of_text() {
        let subs = unique_substrings("abcabd", 2).unwrap();
        assert_eq!(subs, vec!["ab", "bc", "ca", "bd"]);
        assert!(unique_substrings("ab", 3).is_err());
        assert!(unique_substrings("ab", 0).is_err());
    }

    #[test]
    fn substrings_are_char_based() {
        let subs = unique_substrings("héhé", 2).unwrap();
        assert_eq!(subs, vec!["hé", "éh"]);
    }

    #[test]
    fn first_occurrence_map_picks_smallest_index() {
        let keys = ["abc", "abd", "bcd", "abx", "bce"];
        let map = first_occurrence_map(&keys, 2).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("ab"), Some(0));
        assert_eq!(map.get("bc"), Some(2));
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![("ab", 0), ("bc", 2)]);
        assert_eq!(map.members(&keys, "ab"), vec![0, 1, 3]);
        assert!(map.members(&keys, "zz").is_empty());
    }

    #[test]
    fn full_length_prefix_is_identity_on_unique_keys() {
        let keys = ["abc", "abd", "bcd"];
        let map = DedupMap::for_position(&keys, 2).unwrap();
        assert_eq!(map.global_indices(), vec![0, 1, 2]);
    }

    #[test]
    fn prefix_longer_than_key_is_an_error() {
        let err = first_occurrence_map(&["abc", "a"], 2).unwrap_err();
        assert!(matches!(err, SeekError::PrefixTooLong { key_len: 1, prefix_len: 2, .. }));
    }

    proptest! {
        #[test]
        fn unique_keys_is_idempotent(keys in proptest::collection::vec("[a-c]{1,3}", 0..40)) {
            let once = unique_keys(&keys);
            let twice = unique_keys(&once);
            prop_assert_eq!(&once, &twice);
            let distinct: HashSet<_> = keys.iter().collect();
            prop_assert_eq!(once.len(), distinct.len());
        }

        #[test]
        fn dedup_map_grows_with_prefix(keys in proptest::collection::vec("[a-c]{4}", 1..40)) {
            let mut last = 0;
            for t in 0..4 {
                let map = DedupMap::for_position(&keys, t).unwrap();
                prop_assert!(map.len() <= keys.len());
                prop_assert!(map.len() >= last);
                let idx = map.global_indices();
                prop_assert!(idx.windows(2).all(|w| w[0] < w[1]));
                last = map.len();
            }
        }
    }
}
