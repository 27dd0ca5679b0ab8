use siphasher::sip::SipHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

/// Identifies the file a request works on.
///
/// Paths are compared in a normalized form: both `\` and `/` are separators, repeated separators
/// collapse to one, a trailing separator is dropped and ASCII letters are compared without case.
/// The hash of the normalized form is computed once so paths can be compared cheaply while
/// requests are being sorted and grouped.
#[derive(Clone, Default)]
pub struct RequestPath {
    // The path as it was provided, kept for reporting
    path: Arc<str>,
    normalized: Arc<str>,
    hash: u64,
}

impl RequestPath {
    pub fn new(path: &str) -> Self {
        let normalized = normalize(path);
        let hash = if normalized.is_empty() {
            0
        } else {
            let mut hasher = SipHasher::new();
            hasher.write(normalized.as_bytes());
            hasher.finish()
        };

        RequestPath {
            path: Arc::from(path),
            normalized: Arc::from(normalized),
            hash,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        Self::new(&path.to_string_lossy())
    }

    pub fn is_valid(&self) -> bool {
        !self.normalized.is_empty()
    }

    pub fn clear(&mut self) {
        *self = RequestPath::default();
    }

    /// The path as it was provided
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    let mut previous_was_separator = false;
    for c in path.chars() {
        if c == '/' || c == '\\' {
            if !previous_was_separator {
                normalized.push('/');
            }
            previous_was_separator = true;
        } else {
            normalized.push(c.to_ascii_lowercase());
            previous_was_separator = false;
        }
    }

    // Keep a lone root separator
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }

    normalized
}

impl PartialEq for RequestPath {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.hash == other.hash && self.normalized == other.normalized
    }
}

impl Eq for RequestPath {}

impl Hash for RequestPath {
    fn hash<H: Hasher>(
        &self,
        state: &mut H,
    ) {
        self.hash.hash(state);
    }
}

impl fmt::Debug for RequestPath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_tuple("RequestPath").field(&&*self.path).finish()
    }
}

impl fmt::Display for RequestPath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl From<&str> for RequestPath {
    fn from(path: &str) -> Self {
        RequestPath::new(path)
    }
}

impl From<&Path> for RequestPath {
    fn from(path: &Path) -> Self {
        RequestPath::from_path(path)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn case_and_separators_are_ignored() {
        let a = RequestPath::new("Levels\\Town//Terrain.PAK");
        let b = RequestPath::new("levels/town/terrain.pak");
        assert_eq!(a, b);
        assert_eq!(a.hash_value(), b.hash_value());
        assert_eq!(a.normalized(), "levels/town/terrain.pak");
        assert_eq!(a.as_str(), "Levels\\Town//Terrain.PAK");
    }

    #[test]
    fn trailing_separator_is_dropped() {
        assert_eq!(RequestPath::new("assets/"), RequestPath::new("assets"));
        assert_eq!(RequestPath::new("/").normalized(), "/");
    }

    #[test]
    fn different_files_differ() {
        assert_ne!(RequestPath::new("a.bin"), RequestPath::new("b.bin"));
    }

    #[test]
    fn usable_as_key() {
        let mut set = HashSet::new();
        set.insert(RequestPath::new("Data/A.bin"));
        assert!(set.contains(&RequestPath::new("data\\a.bin")));
    }

    #[test]
    fn clear_makes_invalid() {
        let mut path = RequestPath::new("a.bin");
        assert!(path.is_valid());
        path.clear();
        assert!(!path.is_valid());
        assert_eq!(path, RequestPath::default());
    }
}
