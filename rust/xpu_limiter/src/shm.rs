//! POSIX named shared-memory region.
//!
//! One region exists per accelerator die; every container attached to that
//! die maps the same region read-write and coordinates through atomics in
//! the mapped bytes. The region is never unlinked: the last process to exit
//! leaves the state behind for the next newcomer.

use std::ffi::CString;
use std::io;
use std::ptr;

use anyhow::{bail, Result};

/// Name of the scheduling region backing one die.
pub fn region_name(die_id: &str) -> String {
    format!("/xpu-sched-{}", die_id)
}

pub struct Shm {
    size: usize,
    addr: *mut libc::c_void,
    fd: libc::c_int,
}

// The mapping is plain bytes; concurrent access is coordinated by the
// atomics the users place inside it.
unsafe impl Send for Shm {}
unsafe impl Sync for Shm {}

impl Shm {
    /// Open-or-create `name`, size it to `size` bytes and map it shared
    /// read-write. Partial progress is rolled back on failure.
    pub fn init(name: &str, size: usize) -> Result<Self> {
        let cname = match CString::new(name) {
            Ok(cname) => cname,
            Err(_) => bail!("shm name {:?} contains a NUL byte", name),
        };
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            bail!(
                "shm_open {} failed: {}",
                name,
                io::Error::last_os_error()
            );
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("ftruncate {} to {} bytes failed: {}", name, size, err);
        }
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("mmap {} ({} bytes) failed: {}", name, size, err);
        }
        Ok(Self { size, addr, fd })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for Shm {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.addr, self.size);
            libc::close(self.fd);
        }
    }
}
