use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use log::warn;

/// Host-wide exclusive lock over a well-known file.
///
/// The kernel drops a flock when the holding process exits, so a crashed
/// holder never wedges its siblings. A lock that could not be taken stays
/// usable as a guard; callers observe the failure through [`held`].
///
/// [`held`]: FileLock::held
pub struct FileLock {
    fd: libc::c_int,
    held: bool,
}

impl FileLock {
    /// Open-or-create `path` and block until the exclusive lock is ours.
    pub fn exclusive(path: &Path) -> Self {
        let cpath = match CString::new(path.as_os_str().as_bytes()) {
            Ok(cpath) => cpath,
            Err(_) => {
                warn!("lock path {:?} contains a NUL byte", path);
                return Self { fd: -1, held: false };
            }
        };
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_CREAT | libc::O_RDONLY,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            warn!(
                "open lock file {:?} failed: {}",
                path,
                io::Error::last_os_error()
            );
            return Self { fd: -1, held: false };
        }
        let held = unsafe { libc::flock(fd, libc::LOCK_EX) } == 0;
        if !held {
            warn!(
                "flock {:?} failed: {}",
                path,
                io::Error::last_os_error()
            );
        }
        Self { fd, held }
    }

    pub fn held(&self) -> bool {
        self.held
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.fd < 0 {
            return;
        }
        unsafe {
            if self.held {
                libc::flock(self.fd, libc::LOCK_UN);
            }
            libc::close(self.fd);
        }
    }
}
