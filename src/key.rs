use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable, filesystem-safe name for one cached resource.
///
/// A key is also the file name of the resource inside the cache root, so it never
/// contains path separators or a leading dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from a resource identifier (usually the URI string).
    ///
    /// MD5 over the UTF-8 bytes, then SHA-256 over that digest followed by the same bytes,
    /// hex encoded.
    pub fn derive(identifier: &str) -> Self {
        let src = identifier.as_bytes();
        let inner = Md5::digest(src);

        let mut outer = Sha256::new();
        outer.update(inner);
        outer.update(src);
        CacheKey(hex::encode(outer.finalize()))
    }

    /// Build a key from a caller-supplied name.
    ///
    /// ASCII alphanumerics, `_` and `-` are kept; every other byte (including `%`) is
    /// written as `%XX`, so distinct names always give distinct keys. Returns `None` for
    /// an empty name.
    pub fn explicit(name: &str) -> Option<Self> {
        if name.is_empty() {
            return None;
        }
        let mut safe = String::with_capacity(name.len());
        for byte in name.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
                safe.push(byte as char);
            } else {
                safe.push_str(&format!("%{:02X}", byte));
            }
        }
        Some(CacheKey(safe))
    }

    /// Explicit key when one is given, otherwise derived from the identifier.
    pub fn resolve(identifier: &str, explicit: Option<&str>) -> Self {
        explicit
            .and_then(CacheKey::explicit)
            .unwrap_or_else(|| CacheKey::derive(identifier))
    }

    /// Wrap a file name found in the cache root.
    pub(crate) fn from_file_name(name: String) -> Self {
        CacheKey(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derived_key_is_fixed_length_hex() {
        let key = CacheKey::derive("https://video.example.com/clip.mp4?tag=3");
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn explicit_key_is_escaped() {
        let key = CacheKey::explicit("../clips/intro v2.mp4").unwrap();
        assert_eq!(key.as_str(), "%2E%2E%2Fclips%2Fintro%20v2%2Emp4");
        assert_eq!(CacheKey::explicit("clip-a_1").unwrap().as_str(), "clip-a_1");
        assert!(CacheKey::explicit("").is_none());
    }

    #[test]
    fn similar_explicit_keys_stay_distinct() {
        let dotted = CacheKey::explicit("clip.mp4").unwrap();
        let underscored = CacheKey::explicit("clip_mp4").unwrap();
        let escaped = CacheKey::explicit("clip%2Emp4").unwrap();
        assert_ne!(dotted, underscored);
        assert_ne!(dotted, escaped);
        assert_eq!(escaped.as_str(), "clip%252Emp4");
    }

    #[test]
    fn resolve_prefers_explicit_key() {
        let uri = "https://video.example.com/a.mp4";
        assert_eq!(CacheKey::resolve(uri, Some("clip-a")).as_str(), "clip-a");
        assert_eq!(CacheKey::resolve(uri, None), CacheKey::derive(uri));
        assert_eq!(CacheKey::resolve(uri, Some("")), CacheKey::derive(uri));
    }

    proptest! {
        #[test]
        fn derivation_is_deterministic(id in ".*") {
            prop_assert_eq!(CacheKey::derive(&id), CacheKey::derive(&id));
        }

        #[test]
        fn distinct_identifiers_get_distinct_keys(a in "[a-z0-9/:.?=]{1,40}", b in "[a-z0-9/:.?=]{1,40}") {
            prop_assume!(a != b);
            prop_assert_ne!(CacheKey::derive(&a), CacheKey::derive(&b));
        }

        #[test]
        fn explicit_keys_are_plain_file_names(name in ".{1,64}") {
            if let Some(key) = CacheKey::explicit(&name) {
                prop_assert!(!key.as_str().starts_with('.'));
                prop_assert!(key
                    .as_str()
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '%'));
            }
        }

        #[test]
        fn distinct_names_get_distinct_explicit_keys(a in ".{1,24}", b in ".{1,24}") {
            prop_assume!(a != b);
            prop_assert_ne!(CacheKey::explicit(&a), CacheKey::explicit(&b));
        }
    }
}
