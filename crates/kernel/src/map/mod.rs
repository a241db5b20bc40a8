mod inner;

use inner::MapInner;
pub use inner::RuntimeStats;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// A file region mapped by at least one tracked executable.
///
/// Maps are content-addressed by `(path, offset, length)` and shared between
/// exes through cheap clones of the inner [`Arc`].
#[derive(Debug, Default, Clone, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Map {
    inner: Arc<MapInner>,
}

impl Map {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64, update_time: u64) -> Self {
        Self {
            inner: Arc::new(MapInner::new(path, offset, length, update_time)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn length(&self) -> u64 {
        self.inner.length
    }

    pub fn update_time(&self) -> u64 {
        self.inner.update_time
    }

    /// Sequence number assigned by the state at registration.
    pub fn seq(&self) -> Option<u64> {
        self.inner.runtime.lock().seq
    }

    pub fn set_seq(&self, seq: u64) {
        self.inner.runtime.lock().seq.replace(seq);
    }

    pub fn lnprob(&self) -> f32 {
        self.inner.runtime.lock().lnprob
    }

    pub fn zero_lnprob(&self) {
        self.inner.runtime.lock().lnprob = 0.0;
    }

    pub fn increase_lnprob(&self, lnprob: f32) {
        self.inner.runtime.lock().lnprob += lnprob;
    }

    pub fn set_lnprob(&self, lnprob: f32) {
        self.inner.runtime.lock().lnprob = lnprob;
    }

    pub fn block(&self) -> Option<u64> {
        self.inner.runtime.lock().block
    }

    pub fn set_block(&self) -> Result<(), crate::Error> {
        self.inner.set_block()
    }

    pub fn refcount(&self) -> u32 {
        self.inner.runtime.lock().refcount
    }

    /// Increment the exemap refcount, returning the new value. A return of 1
    /// means the caller must register the map.
    pub(crate) fn inc_ref(&self) -> u32 {
        let mut runtime = self.inner.runtime.lock();
        runtime.refcount += 1;
        runtime.refcount
    }

    /// Decrement the exemap refcount, returning the new value. A return of 0
    /// means the caller must unregister the map.
    pub(crate) fn dec_ref(&self) -> u32 {
        let mut runtime = self.inner.runtime.lock();
        debug_assert!(runtime.refcount > 0);
        runtime.refcount = runtime.refcount.saturating_sub(1);
        runtime.refcount
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn identity_is_the_region_triple() {
        let a = Map::new("/lib/libc.so", 0, 4096, 1);
        let b = Map::new("/lib/libc.so", 0, 4096, 99);
        let c = Map::new("/lib/libc.so", 4096, 4096, 1);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn clones_share_runtime_state() {
        let map = Map::new("/bin/cat", 0, 64 << 10, 0);
        let alias = map.clone();
        map.set_lnprob(-1.5);
        assert_eq!(alias.lnprob(), -1.5);

        assert_eq!(map.inc_ref(), 1);
        assert_eq!(alias.inc_ref(), 2);
        assert_eq!(map.dec_ref(), 1);
        assert_eq!(alias.refcount(), 1);
    }
}
