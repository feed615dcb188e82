//! Segment file management.
//!
//! A store directory holds files named `segment-<N>` for monotonically
//! increasing ids. The one with the largest id is active and receives
//! appends; every other segment is sealed and read-only until the
//! compactor deletes or replaces it.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::BufReader;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{KvError, Result};
use crate::index::{IndexEntry, KeyDir};
use crate::record::Record;

/// prefix of every segment file name
pub const SEGMENT_PREFIX: &str = "segment-";
/// suffix of merge output files awaiting their rename
pub const MERGE_SUFFIX: &str = ".merged";

/// Owns the read handles for every segment plus the writable handle of
/// the single active segment.
#[derive(Debug)]
pub struct SegmentSet {
    dir: PathBuf,
    /// read-only handle per segment id, the active segment included
    readers: HashMap<u64, File>,
    /// append handle for the active segment
    active: File,
    active_id: u64,
}

impl SegmentSet {
    /// Opens the segment files in `dir`, creating the directory if needed.
    ///
    /// Leftover `*.tmp` and `*.merged` files from an interrupted merge are
    /// deleted. Surviving segments are scanned in ascending id order into
    /// `index`, so later writes override earlier ones; the active segment
    /// is then created with id `max_seen + 1` (or `0` on a fresh
    /// directory). A decode failure during the scan fails the open.
    pub fn open(dir: &Path, index: &mut KeyDir) -> Result<SegmentSet> {
        fs::create_dir_all(dir)?;

        let mut ids: Vec<u64> = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with(SEGMENT_PREFIX) {
                continue;
            }
            if name.ends_with(MERGE_SUFFIX) || name.ends_with(".tmp") {
                debug!(file = name, "removing leftover merge file");
                let _ = fs::remove_file(dir_entry.path());
                continue;
            }
            match name[SEGMENT_PREFIX.len()..].parse::<u64>() {
                Ok(id) => ids.push(id),
                Err(_) => continue,
            }
        }
        ids.sort_unstable();

        let mut readers = HashMap::new();
        for &id in &ids {
            let file = File::open(segment_path(dir, id))?;
            scan_segment(&file, id, index)?;
            readers.insert(id, file);
        }

        let active_id = match ids.last() {
            Some(max) => max + 1,
            None => 0,
        };
        let (active, reader) = open_active(dir, active_id)?;
        readers.insert(active_id, reader);
        debug!(sealed = ids.len(), active_id, "opened segment set");

        Ok(SegmentSet {
            dir: dir.to_path_buf(),
            readers,
            active,
            active_id,
        })
    }

    /// id of the segment currently receiving appends
    pub fn active_id(&self) -> u64 {
        self.active_id
    }

    /// ids of every sealed segment, ascending
    pub fn sealed_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .readers
            .keys()
            .copied()
            .filter(|&id| id != self.active_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// byte size of the active segment, via stat
    pub fn active_size(&self) -> Result<u64> {
        Ok(self.active.metadata()?.len())
    }

    /// Appends encoded record bytes to the active segment.
    pub fn append(&mut self, encoded: &[u8]) -> Result<()> {
        use std::io::Write;
        self.active.write_all(encoded)?;
        Ok(())
    }

    /// Seals the current active segment and opens `active_id + 1` as the
    /// new active segment. The new file starts empty, so the next append
    /// lands at offset 0.
    pub fn rotate(&mut self) -> Result<()> {
        let next = self.active_id + 1;
        let (active, reader) = open_active(&self.dir, next)?;
        self.active = active;
        self.readers.insert(next, reader);
        self.active_id = next;
        debug!(active_id = next, "rotated to new active segment");
        Ok(())
    }

    /// Reads `size` bytes at `offset` of segment `id` with positional I/O,
    /// so concurrent readers never disturb each other's cursor.
    pub fn read_record_at(&self, id: u64, offset: u64, size: u64) -> Result<Vec<u8>> {
        let file = self.readers.get(&id).ok_or_else(|| {
            KvError::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("segment {} missing from the read map", id),
                ),
            }
        })?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Path of the segment file with the given id.
    pub fn path_of(&self, id: u64) -> PathBuf {
        segment_path(&self.dir, id)
    }

    /// Path of the temp file a merge into `target` writes before its
    /// atomic rename.
    pub fn merge_tmp_path(&self, target: u64) -> PathBuf {
        let name = format!("{}{}{}.tmp", SEGMENT_PREFIX, target, MERGE_SUFFIX);
        self.dir.join(name)
    }

    /// Replaces the read handle for `id` (used after a merge renames its
    /// output over the old file). Closes the previous handle.
    pub fn replace_reader(&mut self, id: u64, file: File) {
        self.readers.insert(id, file);
    }

    /// Closes the read handle of sealed segment `id` and deletes its file.
    pub fn remove_segment(&mut self, id: u64) {
        self.readers.remove(&id);
        let path = segment_path(&self.dir, id);
        if let Err(e) = fs::remove_file(&path) {
            warn!(segment = id, error = %e, "failed to remove merged segment file");
        }
    }

    /// Total bytes of all segment files on disk, skipping merge leftovers.
    pub fn disk_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let name = match name.to_str() {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with(SEGMENT_PREFIX)
                || name.ends_with(MERGE_SUFFIX)
                || name.ends_with(".tmp")
            {
                continue;
            }
            if let Ok(meta) = dir_entry.metadata() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Drops every file handle. The set is unusable afterwards.
    pub fn close(&mut self) {
        self.readers.clear();
    }
}

/// builds `<dir>/segment-<id>`
fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{}{}", SEGMENT_PREFIX, id))
}

/// Opens segment `id` for appending (creating it if absent) plus a
/// read-only handle onto the same file.
fn open_active(dir: &Path, id: u64) -> Result<(File, File)> {
    let path = segment_path(dir, id);
    let active = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(&path)?;
    let reader = File::open(&path)?;
    Ok((active, reader))
}

/// Sequentially decodes every record of a segment, recording each key's
/// location in `index`. Later calls for higher segment ids overwrite
/// earlier entries, which is what makes the rebuilt index reflect the
/// latest write per key.
fn scan_segment(file: &File, id: u64, index: &mut KeyDir) -> Result<()> {
    let mut reader = BufReader::new(file.try_clone()?);
    let mut offset = 0u64;
    loop {
        match Record::decode_from_reader(&mut reader)? {
            None => break,
            Some((record, consumed)) => {
                index.insert(
                    record.key,
                    IndexEntry {
                        segment_id: id,
                        offset,
                        size: consumed as u64,
                        data_type: record.value.data_type(),
                    },
                );
                offset += consumed as u64;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_fresh_dir_creates_segment_zero() {
        let dir = tempdir().unwrap();
        let mut index = KeyDir::new();
        let set = SegmentSet::open(dir.path(), &mut index).unwrap();
        assert_eq!(set.active_id(), 0);
        assert!(set.sealed_ids().is_empty());
        assert!(dir.path().join("segment-0").exists());
        assert!(index.is_empty());
    }

    #[test]
    fn open_removes_merge_leftovers() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("segment-0.merged.tmp"), b"junk").unwrap();
        fs::write(dir.path().join("segment-1.merged"), b"junk").unwrap();

        let mut index = KeyDir::new();
        let set = SegmentSet::open(dir.path(), &mut index).unwrap();
        assert_eq!(set.active_id(), 0);
        assert!(!dir.path().join("segment-0.merged.tmp").exists());
        assert!(!dir.path().join("segment-1.merged").exists());
    }

    #[test]
    fn rotation_seals_the_previous_segment() {
        let dir = tempdir().unwrap();
        let mut index = KeyDir::new();
        let mut set = SegmentSet::open(dir.path(), &mut index).unwrap();

        set.append(&Record::new_str("a", "1").encode()).unwrap();
        set.rotate().unwrap();
        assert_eq!(set.active_id(), 1);
        assert_eq!(set.sealed_ids(), vec![0]);
        assert_eq!(set.active_size().unwrap(), 0);
    }

    #[test]
    fn reopen_rebuilds_index_with_latest_write_winning() {
        let dir = tempdir().unwrap();
        {
            let mut index = KeyDir::new();
            let mut set = SegmentSet::open(dir.path(), &mut index).unwrap();
            set.append(&Record::new_str("k", "old").encode()).unwrap();
            set.rotate().unwrap();
            set.append(&Record::new_str("k", "new").encode()).unwrap();
            set.close();
        }

        let mut index = KeyDir::new();
        let set = SegmentSet::open(dir.path(), &mut index).unwrap();
        // segment-0 and segment-1 survive, active becomes 2
        assert_eq!(set.active_id(), 2);
        let entry = index.get("k").unwrap();
        assert_eq!(entry.segment_id, 1);
        assert_eq!(entry.offset, 0);

        let bytes = set
            .read_record_at(entry.segment_id, entry.offset, entry.size)
            .unwrap();
        let record = Record::decode(&bytes).unwrap();
        assert_eq!(record, Record::new_str("k", "new"));
    }
}
