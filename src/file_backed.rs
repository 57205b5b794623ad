//! The file-backed memory backend keeps committed segments in a
//! private temporary file, so backing capacity is real storage the
//! operating system can page out, not just bookkeeping.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::address::BackingIndex;
use crate::address::Offset;
use crate::address::TypedOffset;
use crate::address::GRANULE_SIZE;
use crate::address::GRANULE_SIZE_SHIFT;
use crate::backend::MemoryBackend;

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory for the file-backed backend's
/// temporary files to `path`.
pub fn set_file_backed_segment_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_PATH.lock().unwrap();

    *global_path = path;
}

/// Returns a temporary File in `FILE_BACKED_PATH`, or in the global
/// `TMPDIR`.
fn get_temp_file() -> std::io::Result<File> {
    let path = FILE_BACKED_PATH.lock().unwrap();

    match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
}

#[derive(Default)]
struct FileBackedState {
    file: Option<File>,
    reserved: BTreeMap<u64, usize>,
    committed: BTreeSet<u32>,
    mappings: BTreeMap<u64, u32>,
}

pub struct FileBackedBackend {
    state: Mutex<FileBackedState>,
}

impl fmt::Debug for FileBackedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBackedBackend").finish()
    }
}

impl Default for FileBackedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FileBackedBackend {
    pub fn new() -> Self {
        FileBackedBackend {
            state: Mutex::new(Default::default()),
        }
    }

    /// Grows the segment file to cover `segment`, creating it lazily.
    fn ensure_storage(state: &mut FileBackedState, segment: u32) -> bool {
        if state.file.is_none() {
            match get_temp_file() {
                Ok(file) => state.file = Some(file),
                Err(_) => return false,
            }
        }

        let file = state.file.as_ref().unwrap();
        let required = (segment as u64 + 1) << GRANULE_SIZE_SHIFT;
        match file.metadata() {
            Ok(meta) if meta.len() >= required => true,
            Ok(_) => file.set_len(required).is_ok(),
            Err(_) => false,
        }
    }
}

impl MemoryBackend for FileBackedBackend {
    fn reserve(&self, start: Offset, size: usize) -> bool {
        let mut state = self.state.lock().unwrap();

        let end = start.raw() + size as u64;
        let overlapping = state
            .reserved
            .range(..end)
            .next_back()
            .map(|(other_start, other_size)| {
                *other_start >= start.raw() || *other_start + *other_size as u64 > start.raw()
            })
            .unwrap_or(false);
        if overlapping {
            return false;
        }

        state.reserved.insert(start.raw(), size);
        true
    }

    fn unreserve(&self, start: Offset, size: usize) {
        let mut state = self.state.lock().unwrap();

        let end = start.raw() + size as u64;
        let mut cursor = start.raw();
        while cursor < end {
            let piece = state
                .reserved
                .remove(&cursor)
                .expect("unreserve must match whole reservations");
            cursor += piece as u64;
        }
        assert_eq!(cursor, end, "unreserve must match whole reservations");
    }

    fn commit(&self, index: BackingIndex, size: usize, _numa_id: u32) -> usize {
        let mut state = self.state.lock().unwrap();

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        let mut committed = 0;
        for i in 0..num_granules {
            let segment = index.raw() as u32 + i as u32;
            if !Self::ensure_storage(&mut state, segment) {
                break;
            }

            state.committed.insert(segment);
            committed += GRANULE_SIZE;
        }

        committed
    }

    fn uncommit(&self, index: BackingIndex, size: usize) -> usize {
        let mut state = self.state.lock().unwrap();

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            state.committed.remove(&(index.raw() as u32 + i as u32));
        }

        // The file itself keeps its length; segment slots are reused
        // for later commits.
        size
    }

    fn map(&self, offset: Offset, index: BackingIndex, size: usize) {
        let mut state = self.state.lock().unwrap();

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            let granule = offset.raw() + (i * GRANULE_SIZE) as u64;
            let segment = index.raw() as u32 + i as u32;
            assert!(
                state.committed.contains(&segment),
                "mapping an uncommitted segment"
            );
            state.mappings.insert(granule, segment);
        }
    }

    fn unmap(&self, offset: Offset, size: usize) {
        let mut state = self.state.lock().unwrap();

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            state.mappings.remove(&(offset.raw() + (i * GRANULE_SIZE) as u64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_grows_the_segment_file() {
        let backend = FileBackedBackend::new();

        assert_eq!(
            backend.commit(BackingIndex::new(0), 2 * GRANULE_SIZE, 0),
            2 * GRANULE_SIZE
        );

        let state = backend.state.lock().unwrap();
        let len = state.file.as_ref().unwrap().metadata().unwrap().len();
        assert!(len >= 2 * GRANULE_SIZE as u64);
    }

    #[test]
    fn commit_uncommit_round_trip() {
        let backend = FileBackedBackend::new();

        backend.commit(BackingIndex::new(3), GRANULE_SIZE, 0);
        backend.map(Offset::zero(), BackingIndex::new(3), GRANULE_SIZE);
        backend.unmap(Offset::zero(), GRANULE_SIZE);
        assert_eq!(backend.uncommit(BackingIndex::new(3), GRANULE_SIZE), GRANULE_SIZE);
    }
}
