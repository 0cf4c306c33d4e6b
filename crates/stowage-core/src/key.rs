//! Storage keys
//!
//! A [`StorageKey`] is the canonical, backend-neutral name of an object: an
//! ordered sequence of non-empty segments. Keys laid out this way are amenable
//! to prefix scans, and two keys are equal exactly when their segments are.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Segment separator used in raw paths and in a key's display form
pub const SEPARATOR: char = '/';

/// Maximum length in bytes of a key's display form
pub const MAX_KEY_LEN: usize = 1024;

/// A normalized object key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(Vec<String>);

impl StorageKey {
    /// Canonicalize a user-supplied path.
    ///
    /// Splits on `/`, drops empty segments produced by leading, trailing, or
    /// repeated separators, and rejects `.`/`..` segments, control characters,
    /// empty keys, and keys longer than [`MAX_KEY_LEN`].
    pub fn normalize(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in raw.split(SEPARATOR).filter(|s| !s.is_empty()) {
            validate_segment(raw, segment)?;
            segments.push(segment.to_string());
        }

        if segments.is_empty() {
            return Err(StorageError::InvalidKey(format!(
                "{:?} has no path segments",
                raw
            )));
        }

        let key = Self(segments);
        let len = key.display_len();
        if len > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey(format!(
                "key is {} bytes, maximum is {}",
                len, MAX_KEY_LEN
            )));
        }
        Ok(key)
    }

    /// Append `relative` to `base` and re-normalize the result
    pub fn join(base: &StorageKey, relative: &str) -> Result<Self> {
        Self::normalize(&format!("{}{}{}", base, SEPARATOR, relative))
    }

    /// Check whether `self` names `other` or a virtual directory containing it.
    ///
    /// Comparison is segment-wise: `a/b` is a prefix of `a/b/c` but not of `a/bc`.
    pub fn is_prefix_of(&self, other: &StorageKey) -> bool {
        other.0.len() >= self.0.len() && other.0.iter().zip(&self.0).all(|(a, b)| a == b)
    }

    /// The key's segments in order
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Last segment
    pub fn file_name(&self) -> &str {
        // normalize() guarantees at least one segment
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    /// Key of the enclosing virtual directory, if any
    pub fn parent(&self) -> Option<StorageKey> {
        if self.0.len() > 1 {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        } else {
            None
        }
    }

    /// Number of segments
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    fn display_len(&self) -> usize {
        self.0.iter().map(String::len).sum::<usize>() + self.0.len() - 1
    }
}

fn validate_segment(raw: &str, segment: &str) -> Result<()> {
    if segment == "." || segment == ".." {
        return Err(StorageError::InvalidKey(format!(
            "{:?} contains relative segment {:?}",
            raw, segment
        )));
    }
    if segment.chars().any(char::is_control) {
        return Err(StorageError::InvalidKey(format!(
            "{:?} contains a control character",
            raw
        )));
    }
    Ok(())
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", SEPARATOR)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl FromStr for StorageKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::normalize(s)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self> {
        Self::normalize(&value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> StorageKey {
        StorageKey::normalize(raw).unwrap()
    }

    mod normalize {
        use super::*;

        #[test]
        fn test_simple_path() {
            assert_eq!(key("a/b/c.txt").segments(), &["a", "b", "c.txt"]);
        }

        #[test]
        fn test_collapses_separators() {
            assert_eq!(key("//a///b/"), key("a/b"));
            assert_eq!(key("/a/b").to_string(), "a/b");
        }

        #[test]
        fn test_rejects_dot_segments() {
            for raw in [".", "..", "a/./b", "a/../b", "../etc/passwd", "a/b/.."] {
                let err = StorageKey::normalize(raw).unwrap_err();
                assert!(matches!(err, StorageError::InvalidKey(_)), "{raw}");
            }
        }

        #[test]
        fn test_dots_inside_segment_allowed() {
            assert_eq!(key("a/..b/c.").segments(), &["a", "..b", "c."]);
        }

        #[test]
        fn test_rejects_control_characters() {
            assert!(StorageKey::normalize("a/b\0c").is_err());
            assert!(StorageKey::normalize("a/\nb").is_err());
            assert!(StorageKey::normalize("tab\there").is_err());
        }

        #[test]
        fn test_rejects_empty() {
            assert!(StorageKey::normalize("").is_err());
            assert!(StorageKey::normalize("///").is_err());
        }

        #[test]
        fn test_rejects_overlong() {
            let raw = "x".repeat(MAX_KEY_LEN + 1);
            assert!(StorageKey::normalize(&raw).is_err());
            let raw = "x".repeat(MAX_KEY_LEN);
            assert!(StorageKey::normalize(&raw).is_ok());
        }

        #[test]
        fn test_unicode_segments() {
            assert_eq!(key("données/résumé.pdf").file_name(), "résumé.pdf");
        }
    }

    mod relations {
        use super::*;

        #[test]
        fn test_join() {
            let joined = StorageKey::join(&key("a/b"), "c/d.txt").unwrap();
            assert_eq!(joined, key("a/b/c/d.txt"));
        }

        #[test]
        fn test_join_rejects_traversal() {
            assert!(StorageKey::join(&key("a/b"), "../c").is_err());
        }

        #[test]
        fn test_is_prefix_of_is_segment_wise() {
            assert!(key("a/b").is_prefix_of(&key("a/b/c.txt")));
            assert!(key("a/b").is_prefix_of(&key("a/b")));
            assert!(!key("a/b").is_prefix_of(&key("a/bc")));
            assert!(!key("a/b/c").is_prefix_of(&key("a/b")));
        }

        #[test]
        fn test_parent() {
            assert_eq!(key("a/b/c").parent(), Some(key("a/b")));
            assert_eq!(key("a").parent(), None);
        }

        #[test]
        fn test_ordering_is_by_segment() {
            assert!(key("a/b") < key("a/b/c"));
            assert!(key("a/b/c") < key("a/c"));
        }
    }

    mod serde_form {
        use super::*;

        #[test]
        fn test_serializes_as_string() {
            let json = serde_json::to_string(&key("a/b")).unwrap();
            assert_eq!(json, "\"a/b\"");
        }

        #[test]
        fn test_deserialize_validates() {
            let parsed: StorageKey = serde_json::from_str("\"/x//y/\"").unwrap();
            assert_eq!(parsed, key("x/y"));
            assert!(serde_json::from_str::<StorageKey>("\"x/../y\"").is_err());
        }
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_normalize_is_idempotent(raw in "[a-z0-9./_-]{0,48}") {
                if let Ok(once) = StorageKey::normalize(&raw) {
                    let twice = StorageKey::normalize(&once.to_string()).unwrap();
                    prop_assert_eq!(once, twice);
                }
            }

            #[test]
            fn prop_dot_segments_always_rejected(
                segments in proptest::collection::vec("[a-z0-9]{1,8}", 0..6),
                dots in prop_oneof![Just("."), Just("..")],
                position in 0usize..6,
            ) {
                let mut segments = segments;
                let position = position.min(segments.len());
                segments.insert(position, dots.to_string());
                let raw = segments.join("/");
                prop_assert!(matches!(
                    StorageKey::normalize(&raw),
                    Err(StorageError::InvalidKey(_))
                ));
            }

            #[test]
            fn prop_join_is_prefix(
                base in "[a-z]{1,6}(/[a-z]{1,6}){0,3}",
                rest in "[a-z]{1,6}(/[a-z]{1,6}){0,3}",
            ) {
                let base = StorageKey::normalize(&base).unwrap();
                let joined = StorageKey::join(&base, &rest).unwrap();
                prop_assert!(base.is_prefix_of(&joined));
            }
        }
    }
}
