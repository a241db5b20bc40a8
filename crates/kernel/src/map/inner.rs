use parking_lot::Mutex;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::os::linux::fs::MetadataExt;
use std::path::PathBuf;

/// Runtime statistics of a map. Never persisted, never part of the map's
/// identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeStats {
    /// Log probability of the map NOT being needed in the next period.
    pub lnprob: f32,

    /// Unique map sequence number assigned at registration.
    pub seq: Option<u64>,

    /// Device-order sort key used while dispatching readahead. `None` until
    /// probed; probing failure leaves `Some(0)` so it is not retried.
    pub block: Option<u64>,

    /// Number of exemaps holding a reference. A map is registered iff this
    /// is non-zero.
    pub refcount: u32,
}

#[derive(Debug, Default)]
pub struct MapInner {
    /// Absolute path to the mapped file.
    pub path: PathBuf,

    /// Offset of the mapped region in bytes.
    pub offset: u64,

    /// Length of the mapped region in bytes.
    pub length: u64,

    /// Model time the map was last registered or reloaded.
    pub update_time: u64,

    pub runtime: Mutex<RuntimeStats>,
}

impl MapInner {
    pub fn new(path: impl Into<PathBuf>, offset: u64, length: u64, update_time: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
            update_time,
            runtime: Mutex::default(),
        }
    }

    /// Populate the block hint from filesystem metadata, best effort.
    pub fn set_block(&self) -> Result<(), crate::Error> {
        // pre-set so a failing stat is not retried every cycle
        self.runtime.lock().block = Some(0);
        let meta = self.path.metadata()?;
        self.runtime.lock().block = Some(meta.st_ino());
        Ok(())
    }
}

// Identity is the (path, offset, length) triple: two maps describing the
// same region are the same map.
impl PartialEq for MapInner {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.length == other.length && self.path == other.path
    }
}

impl Eq for MapInner {}

impl Hash for MapInner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
        self.offset.hash(state);
        self.length.hash(state);
    }
}

impl PartialOrd for MapInner {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MapInner {
    fn cmp(&self, other: &Self) -> Ordering {
        self.path
            .cmp(&other.path)
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| self.length.cmp(&other.length))
    }
}
