//! Shared-memory region for the mmap low-latency path
//!
//! The driver hands over a file-descriptor-backed region of bounded length,
//! divided into slices of `length_per_trans` bytes. Exactly one paced thread
//! reads or writes the region per period, so a coarse lock is enough.

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::constants::MAX_SHARED_MEMORY_LEN;
use crate::error::{Error, Result};

pub struct SharedMemory {
    map: Mutex<MmapMut>,
    len: usize,
}

impl SharedMemory {
    /// Map `len` bytes of `file` read-write
    pub fn map_file(file: &File, len: usize) -> Result<Self> {
        check_len(len)?;
        let map = unsafe {
            MmapOptions::new()
                .len(len)
                .map_mut(file)
                .map_err(|e| Error::Failed(format!("mmap shared audio region: {}", e)))?
        };
        Ok(Self {
            map: Mutex::new(map),
            len,
        })
    }

    /// Anonymous region, for in-process drivers
    pub fn anonymous(len: usize) -> Result<Self> {
        check_len(len)?;
        let map = MmapMut::map_anon(len)?;
        Ok(Self {
            map: Mutex::new(map),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the region at `offset`
    pub fn write_at(&self, data: &[u8], offset: usize) -> Result<()> {
        let end = self.checked_end(offset, data.len())?;
        self.map.lock()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Fill `buf` from the region at `offset`
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let end = self.checked_end(offset, buf.len())?;
        buf.copy_from_slice(&self.map.lock()[offset..end]);
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.map.lock().flush()?;
        Ok(())
    }

    fn checked_end(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(end),
            _ => Err(Error::CapacityExceeded {
                len: offset.saturating_add(len),
                capacity: self.len,
            }),
        }
    }
}

fn check_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_SHARED_MEMORY_LEN {
        return Err(Error::ParamInvalid(format!(
            "shared memory length {} outside (0, {}]",
            len, MAX_SHARED_MEMORY_LEN
        )));
    }
    Ok(())
}

/// Driver-provided region description, recorded by `RefreshAshmemInfo`
pub struct AshmemInfo {
    pub file: File,
    pub len: usize,
    pub length_per_trans: usize,
}

impl AshmemInfo {
    pub fn validate(&self) -> Result<()> {
        check_len(self.len)?;
        if self.length_per_trans == 0 || self.len % self.length_per_trans != 0 {
            return Err(Error::ParamInvalid(format!(
                "slice length {} does not divide region of {}",
                self.length_per_trans, self.len
            )));
        }
        Ok(())
    }
}
