//! Explicit synchronization primitives
//!
//! Wraps the kernel sync-file fds that flow through the present pipeline:
//! acquire fences attached to incoming layers and retire fences handed back
//! from atomic commits. A `Fence` owns its fd and closes it on drop, so fence
//! lifetime mistakes show up as type errors instead of fd leaks.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

/// An owned sync-file descriptor.
///
/// Signaled when the producer (GPU render job) or the display hardware is
/// done with the buffer the fence guards.
#[derive(Debug)]
pub struct Fence {
    fd: OwnedFd,
}

impl Fence {
    /// Takes ownership of a raw sync-file fd.
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open file descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }

    /// Duplicates the underlying fd.
    ///
    /// Used when attaching a layer's acquire fence to a plane: the kernel
    /// consumes the duplicate while the submitter keeps the original.
    pub fn dup(&self) -> io::Result<Fence> {
        let raw = unsafe { libc::dup(self.fd.as_raw_fd()) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { Fence::from_raw_fd(raw) })
    }

    /// Blocks until the fence signals or `timeout_ms` expires.
    ///
    /// A negative timeout waits forever. Returns `Ok(true)` when signaled,
    /// `Ok(false)` on timeout.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret > 0 {
                return Ok(true);
            }
            if ret == 0 {
                return Ok(false);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Merges two fences into one that signals when both have signaled.
    ///
    /// Consumes both inputs; the kernel keeps references through the merged
    /// sync file.
    pub fn merge(name: &str, a: Fence, b: Fence) -> io::Result<Fence> {
        let mut data = SyncMergeData {
            name: [0; 32],
            fd2: b.fd.as_raw_fd(),
            fence: -1,
            flags: 0,
            pad: 0,
        };
        for (dst, src) in data.name.iter_mut().zip(name.bytes().take(31)) {
            *dst = src as libc::c_char;
        }
        let ret = unsafe { libc::ioctl(a.fd.as_raw_fd(), SYNC_IOC_MERGE, &mut data) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { Fence::from_raw_fd(data.fence) })
    }

    /// Releases ownership and returns the raw fd.
    pub fn into_raw_fd(self) -> RawFd {
        self.fd.into_raw_fd()
    }
}

impl AsRawFd for Fence {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

// struct sync_merge_data from <linux/sync_file.h>
#[repr(C)]
struct SyncMergeData {
    name: [libc::c_char; 32],
    fd2: i32,
    fence: i32,
    flags: u32,
    pad: u32,
}

// _IOWR('>', 3, struct sync_merge_data)
const SYNC_IOC_MERGE: libc::c_ulong = 0xc030_3e03;
