use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

/// The I/O sorting strategy applied to the maps selected for readahead.
///
/// Encoded as an integer in the config file for compatibility with the
/// historical daemon: 0 none, 1 path, 2 block, 3 block-then-path. Like every
/// other config value, an out-of-range integer is logged and replaced by the
/// default rather than failing the load.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SortStrategy {
    /// No sorting. Useful when the backing store has no seek penalty.
    None,

    /// Sort based on file path only. Useful for network filesystems.
    Path,

    /// Sort based on the on-disk block hint; maps without a hint keep their
    /// relative order.
    Block,

    /// Sort by block hint where available, falling back to path order.
    #[default]
    BlockThenPath,
}

impl SortStrategy {
    pub const fn as_u8(self) -> u8 {
        match self {
            SortStrategy::None => 0,
            SortStrategy::Path => 1,
            SortStrategy::Block => 2,
            SortStrategy::BlockThenPath => 3,
        }
    }
}

impl TryFrom<u8> for SortStrategy {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(SortStrategy::None),
            1 => Ok(SortStrategy::Path),
            2 => Ok(SortStrategy::Block),
            3 => Ok(SortStrategy::BlockThenPath),
            other => Err(other),
        }
    }
}

impl Serialize for SortStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for SortStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Ok(SortStrategy::try_from(raw).unwrap_or_else(|value| {
            warn!(value, "sortstrategy out of range, using default");
            SortStrategy::default()
        }))
    }
}
