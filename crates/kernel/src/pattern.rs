//! Path classification primitives for the two pools.
//!
//! Exclusion patterns are globs where `*` never crosses a `/`, matching the
//! semantics of `fnmatch(3)` with `FNM_PATHNAME`. User-app prefixes are
//! directory prefixes with a boundary check so `/opt` matches `/opt/app` but
//! never `/optical`.

use crate::Error;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

/// A compiled list of exclusion globs.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    set: GlobSet,
}

impl PatternSet {
    /// Compile a list of glob patterns. Invalid patterns fail loudly; the
    /// caller decides whether to fall back to an empty set.
    pub fn compile<T: AsRef<str>>(patterns: &[T]) -> Result<Self, Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|source| Error::InvalidPattern {
                    pattern: pattern.to_owned(),
                    source,
                })?;
            builder.add(glob);
        }
        let set = builder.build().map_err(|source| Error::InvalidPattern {
            pattern: String::new(),
            source,
        })?;
        Ok(Self { set })
    }

    pub fn matches_any(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Test whether `path` equals one of the prefixes or lives under one of them.
///
/// The character after the prefix must be `/` for a match, so prefix `/opt`
/// matches `/opt` and `/opt/app` but not `/optical`.
pub fn under_any<T: AsRef<str>>(path: &Path, prefixes: &[T]) -> bool {
    let Some(path) = path.to_str() else {
        return false;
    };
    prefixes.iter().any(|prefix| {
        let prefix = prefix.as_ref().trim_end_matches('/');
        if prefix.is_empty() {
            return false;
        }
        match path.strip_prefix(prefix) {
            Some("") => true,
            Some(rest) => rest.starts_with('/'),
            None => false,
        }
    })
}
