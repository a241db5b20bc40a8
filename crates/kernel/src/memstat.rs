use crate::Error;
use procfs::{Current, Meminfo};

/// Snapshot of `/proc/meminfo`, in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStat {
    pub total: u64,
    pub free: u64,
    pub cached: u64,
    pub buffers: u64,
}

impl MemStat {
    pub fn try_new() -> Result<Self, Error> {
        let mem = Meminfo::current()?;
        Ok(Self {
            total: mem.mem_total,
            free: mem.mem_free,
            cached: mem.cached,
            buffers: mem.buffers,
        })
    }
}
