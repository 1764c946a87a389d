//! OS-level zero-copy mapping of model files, with optional page locking.

use crate::error::{Error, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;

/// Read-only mapping of a whole model file.
///
/// With `numa` set, the kernel is not asked to prefault pages so that
/// first-touch allocation places them on the right node.
pub struct ModelMapping {
    map: Mmap,
}

impl ModelMapping {
    pub fn new(file: &File, numa: bool) -> Result<Self> {
        let mut opts = MmapOptions::new();
        if !numa {
            #[cfg(target_os = "linux")]
            opts.populate();
        }
        let map = unsafe { opts.map(file) }
            .map_err(|e| Error::AllocationFailure(format!("mmap failed: {}", e)))?;
        #[cfg(unix)]
        if !numa {
            let _ = map.advise(memmap2::Advice::WillNeed);
        }
        Ok(Self { map })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Hint that a payload range uploaded elsewhere will not be read again.
    pub fn discard(&self, offset: usize, len: usize) {
        #[cfg(unix)]
        {
            let _ = unsafe {
                self.map
                    .unchecked_advise_range(memmap2::UncheckedAdvice::DontNeed, offset, len)
            };
        }
        #[cfg(not(unix))]
        {
            let _ = (offset, len);
        }
    }

    /// Try to pin the mapping's pages in RAM. Failure is reported but not
    /// fatal; the kernel may simply refuse beyond RLIMIT_MEMLOCK.
    pub fn try_lock(&self) -> bool {
        #[cfg(unix)]
        {
            match self.map.lock() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("failed to mlock {}-byte mapping: {}", self.map.len(), e);
                    false
                }
            }
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

/// Tracks how much of a mapping the loader wants locked; the lock itself is
/// taken once, on the first growth request.
#[derive(Default)]
pub struct MemoryLock {
    target: usize,
    locked: bool,
    failed: bool,
}

impl MemoryLock {
    pub fn grow_to(&mut self, mapping: &ModelMapping, size: usize) {
        self.target = self.target.max(size);
        if !self.locked && !self.failed {
            if mapping.try_lock() {
                self.locked = true;
            } else {
                self.failed = true;
            }
        }
    }

    pub fn locked_bytes(&self) -> usize {
        if self.locked {
            self.target
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"ggjt mapping test").unwrap();
        file.flush().unwrap();

        let mapping = ModelMapping::new(file.as_file(), false).unwrap();
        assert_eq!(mapping.as_slice(), b"ggjt mapping test");
        assert_eq!(mapping.len(), 17);
        // discard must be safe on any in-bounds range
        mapping.discard(0, 8);
    }
}
