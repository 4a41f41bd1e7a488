//! Concrete shared-memory backends for the coverage bitmap: a POSIX
//! named-object reader and a System V integer-id reader.

use std::os::fd::RawFd;

use memmap2::{Mmap, MmapOptions};

use super::CoverageSource;
use crate::error::BitmapError;

/// Path-style handle beginning with `/`: `shm_open` read-only, `mmap` the
/// region, then close the descriptor (the mapping keeps the pages alive).
pub struct PosixShmem {
    mmap: Mmap,
}

impl PosixShmem {
    pub fn attach(name: &str, map_size: usize) -> Result<Self, BitmapError> {
        let c_name = std::ffi::CString::new(name).map_err(|_| BitmapError::AttachFailed {
            handle: name.to_string(),
            errno: 0,
        })?;
        let fd: RawFd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return Err(BitmapError::AttachFailed {
                handle: name.to_string(),
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            });
        }
        let mmap = unsafe {
            MmapOptions::new()
                .len(map_size)
                .map(fd)
                .map_err(|_| BitmapError::AttachFailed {
                    handle: name.to_string(),
                    errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
                })
        };
        unsafe {
            libc::close(fd);
        }
        Ok(Self { mmap: mmap? })
    }
}

impl CoverageSource for PosixShmem {
    fn snapshot(&self) -> &[u8] {
        &self.mmap
    }
}

/// Integer handle: attach a System V IPC shared segment read-only, detach on
/// `Drop`.
pub struct SysVShmem {
    addr: *const libc::c_void,
    len: usize,
}

// The segment is attached read-only for the lifetime of this struct and is
// never written from Rust; sharing the read view across threads is safe.
unsafe impl Send for SysVShmem {}
unsafe impl Sync for SysVShmem {}

impl SysVShmem {
    pub fn attach(id: i32, map_size: usize) -> Result<Self, BitmapError> {
        let addr = unsafe { libc::shmat(id, std::ptr::null(), libc::SHM_RDONLY) };
        if addr as isize == -1 {
            return Err(BitmapError::AttachFailed {
                handle: id.to_string(),
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
            });
        }
        Ok(Self {
            addr,
            len: map_size,
        })
    }
}

impl CoverageSource for SysVShmem {
    fn snapshot(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for SysVShmem {
    fn drop(&mut self) {
        unsafe {
            libc::shmdt(self.addr);
        }
    }
}
