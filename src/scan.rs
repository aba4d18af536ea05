//! # Scan
//!
//! Slides a [`BytePattern`] across a [`MemoryView`]

use crate::pattern::{BytePattern, Matcher};
use crate::view::MemoryView;

/// Returns the address of every position in `view` where `pattern` fully matches.
///
/// Addresses come back in ascending order. Overlapping matches are all reported.
pub fn scan(view: &MemoryView<'_>, pattern: &BytePattern) -> Vec<usize> {
    let haystack = view.as_bytes();
    scan_slice(haystack, pattern)
        .into_iter()
        .map(|offset| view.base() + offset)
        .collect()
}

/// Returns the offset of every match of `pattern` inside `haystack`
pub fn scan_slice(haystack: &[u8], pattern: &BytePattern) -> Vec<usize> {
    let needle = pattern.matchers();
    if needle.is_empty() || needle.len() > haystack.len() {
        return Vec::new();
    }

    // the first exact byte lets us skip most offsets without walking the whole pattern
    let anchor = needle.iter().enumerate().find_map(|(i, m)| match m {
        Matcher::Exact(b) => Some((i, *b)),
        Matcher::Any => None,
    });

    let last = haystack.len() - needle.len();
    let mut matches = Vec::new();
    for start in 0..=last {
        if let Some((i, b)) = anchor {
            if haystack[start + i] != b {
                continue;
            }
        }
        if pattern.matches_at(&haystack[start..start + needle.len()]) {
            matches.push(start);
        }
    }
    matches
}
