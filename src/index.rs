//! The in-memory key directory.

use std::collections::HashMap;

use crate::record::DataType;

/// Physical location of the most recent record written for a key.
///
/// Reading `size` bytes at `offset` of segment `segment_id` and decoding
/// them yields a record whose key and type match this entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// id of the segment file holding the record
    pub segment_id: u64,
    /// byte offset of the record within the segment
    pub offset: u64,
    /// total encoded size of the record
    pub size: u64,
    /// the record's declared value type
    pub data_type: DataType,
}

/// Maps each live key to the location of its latest record.
///
/// Rebuilt on open by scanning segments in ascending id order and letting
/// later inserts overwrite earlier ones.
pub type KeyDir = HashMap<String, IndexEntry>;
