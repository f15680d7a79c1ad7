// Copyright (c) The arbiterd Authors.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-process shared-memory region.
//!
//! Each registered process maps one page-sized file that the server uses for
//! lock-free server-to-client signalling. The layout is ABI-stable across
//! both sides of the mmap: offset 0 holds `releaseRequestCount`, a 64-bit
//! counter the server bumps (release store) to demand that the process
//! vacate one core, and which the client reads with an acquire load; offset
//! 8 holds `threadPreempted`, one byte the server sets when it forcibly
//! preempts a thread and which only the client clears. The remaining space
//! is reserved.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub const SHM_REGION_SIZE: usize = 4096;
pub const RELEASE_REQUEST_COUNT_OFFSET: usize = 0;
pub const THREAD_PREEMPTED_OFFSET: usize = 8;

pub struct ShmemRegion {
    ptr: *mut u8,
    path: PathBuf,
}

// The region is owned by exactly one side of the map; the raw pointer is
// never shared between server threads.
unsafe impl Send for ShmemRegion {}

impl ShmemRegion {
    /// Open and map the backing file read-write, sizing it to one page. The
    /// file normally already exists (the client created and mapped it before
    /// registering); creating it here covers a client that registers first.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening shared memory file {}", path.display()))?;
        file.set_len(SHM_REGION_SIZE as u64)
            .with_context(|| format!("sizing shared memory file {}", path.display()))?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                SHM_REGION_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!(
                "mmap of {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            );
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn release_request_count(&self) -> &AtomicU64 {
        unsafe { &*(self.ptr.add(RELEASE_REQUEST_COUNT_OFFSET) as *const AtomicU64) }
    }

    fn thread_preempted(&self) -> &AtomicU8 {
        unsafe { &*(self.ptr.add(THREAD_PREEMPTED_OFFSET) as *const AtomicU8) }
    }

    /// Server side: demand that the owning process vacate one more core.
    /// Returns the new counter value.
    pub fn bump_release_requests(&self) -> u64 {
        self.release_request_count().fetch_add(1, Ordering::Release) + 1
    }

    /// Server side: flag that one of the process's threads was preempted.
    pub fn set_thread_preempted(&self) {
        self.thread_preempted().store(1, Ordering::Release);
    }

    /// Client side: read the release-request counter.
    pub fn release_requests(&self) -> u64 {
        self.release_request_count().load(Ordering::Acquire)
    }

    /// Client side: was one of this process's threads preempted?
    pub fn preempted(&self) -> bool {
        self.thread_preempted().load(Ordering::Acquire) != 0
    }

    /// Client side: acknowledge the preemption notice.
    pub fn clear_thread_preempted(&self) {
        self.thread_preempted().store(0, Ordering::Release);
    }
}

impl Drop for ShmemRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, SHM_REGION_SIZE);
        }
    }
}
