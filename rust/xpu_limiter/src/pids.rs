//! Host-pid to container-pid translation.
//!
//! The device plugin maintains `pids.config` in the container's config
//! directory; each line maps one host pid to the pid the same process has
//! inside the container. Accelerator queries report host pids, so every
//! per-process attribution goes through this map. A filesystem watch keeps
//! the in-memory map eventually consistent with the file.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use log::{error, info, trace, warn};

use crate::register;

pub const PIDS_CONFIG_NAME: &str = "pids.config";

const VALUE_WIDTH: usize = 11;
const LINE_LEN: usize = VALUE_WIDTH * 2 + 1;

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_INOTIFY_EVENT_CNT: usize = 10;
const EVENT_BUF_LEN: usize =
    MAX_INOTIFY_EVENT_CNT * (mem::size_of::<libc::inotify_event>() + MAX_FILE_NAME_LEN + 1);

/// The kernel lays events out back to back; the buffer itself must be
/// aligned for the event header.
#[repr(C, align(4))]
struct EventBuf {
    data: [u8; EVENT_BUF_LEN],
}

pub struct PidManager {
    dir: PathBuf,
    map: Mutex<HashMap<i32, i32>>,
}

impl PidManager {
    pub fn new(dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            dir,
            map: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(PIDS_CONFIG_NAME)
    }

    /// Start the config watcher and announce this container to the device
    /// plugin. Registration retries run off-thread; failure is logged and
    /// does not tear down the watcher.
    pub fn initialize(self: &Arc<Self>, cgroup_file: &Path) -> Result<()> {
        self.spawn_watcher()?;
        let cgroup_file = cgroup_file.to_path_buf();
        std::thread::Builder::new()
            .name("xpu-register".into())
            .spawn(move || {
                if let Err(e) = register::register_to_device_plugin(&cgroup_file) {
                    warn!("device plugin registration failed: {:#}", e);
                }
            })
            .context("failed to spawn registration thread")?;
        Ok(())
    }

    pub fn spawn_watcher(self: &Arc<Self>) -> Result<()> {
        let this = self.clone();
        std::thread::Builder::new()
            .name("xpu-pids-watch".into())
            .spawn(move || this.watch_loop())
            .context("failed to spawn pids watcher thread")?;
        Ok(())
    }

    /// Re-read the config file and swap the map in one step. Malformed
    /// lines are skipped, valid ones still load.
    pub fn refresh(&self) -> Result<()> {
        let path = self.path();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {:?}", path))?;
        let mut next = HashMap::new();
        for line in content.lines() {
            if line.len() != LINE_LEN {
                continue;
            }
            let (Some(host_field), Some(container_field)) =
                (line.get(..VALUE_WIDTH), line.get(VALUE_WIDTH + 1..))
            else {
                continue;
            };
            let Some(host_pid) = parse_pid(host_field) else {
                continue;
            };
            let Some(container_pid) = parse_pid(container_field) else {
                continue;
            };
            next.insert(host_pid, container_pid);
        }
        *self.map.lock().unwrap() = next;
        Ok(())
    }

    pub fn container_pid(&self, host_pid: i32) -> Option<i32> {
        self.map.lock().unwrap().get(&host_pid).copied()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    fn watch_loop(&self) {
        if let Err(e) = self.watch_config_dir() {
            error!("pids watcher stopped: {:#}", e);
        }
    }

    fn watch_config_dir(&self) -> Result<()> {
        let fd = unsafe { libc::inotify_init() };
        if fd < 0 {
            bail!("inotify_init failed: {}", io::Error::last_os_error());
        }
        let cdir = CString::new(self.dir.as_os_str().as_bytes())
            .context("config dir path contains a NUL byte")?;
        let wd = unsafe {
            libc::inotify_add_watch(fd, cdir.as_ptr(), libc::IN_MODIFY | libc::IN_CREATE)
        };
        if wd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("inotify_add_watch {:?} failed: {}", self.dir, err);
        }

        if self.path().exists() {
            if let Err(e) = self.refresh() {
                error!("initial pids load failed: {:#}", e);
            }
        }

        let mut buf = EventBuf {
            data: [0; EVENT_BUF_LEN],
        };
        loop {
            let n = unsafe {
                libc::read(
                    fd,
                    buf.data.as_mut_ptr() as *mut libc::c_void,
                    EVENT_BUF_LEN,
                )
            };
            if n < mem::size_of::<libc::inotify_event>() as isize {
                break;
            }
            let mut offset = 0usize;
            while offset < n as usize {
                let event =
                    unsafe { &*(buf.data.as_ptr().add(offset) as *const libc::inotify_event) };
                self.process_event(event, unsafe {
                    event_name(buf.data.as_ptr().add(offset), event.len as usize)
                });
                offset += mem::size_of::<libc::inotify_event>() + event.len as usize;
            }
        }

        unsafe {
            libc::inotify_rm_watch(fd, wd);
            libc::close(fd);
        }
        Ok(())
    }

    fn process_event(&self, event: &libc::inotify_event, name: Option<String>) {
        if event.mask & (libc::IN_CREATE | libc::IN_MODIFY) == 0 {
            return;
        }
        let Some(name) = name else { return };
        trace!("config dir event on {:?}", name);
        if name != PIDS_CONFIG_NAME {
            return;
        }
        info!("reloading pids config");
        if let Err(e) = self.refresh() {
            error!("pids config reload failed: {:#}", e);
        }
    }
}

/// Fixed-width decimal pid field. Anything non-positive or beyond i32 is
/// rejected.
fn parse_pid(field: &str) -> Option<i32> {
    let value: i64 = field.trim().parse().ok()?;
    if value <= 0 || value > i32::MAX as i64 {
        return None;
    }
    Some(value as i32)
}

/// # Safety
///
/// `ptr` must point at a complete inotify_event with `len` name bytes
/// behind the header.
unsafe fn event_name(ptr: *const u8, len: usize) -> Option<String> {
    if len == 0 {
        return None;
    }
    let name_ptr = ptr.add(mem::size_of::<libc::inotify_event>()) as *const libc::c_char;
    Some(CStr::from_ptr(name_ptr).to_string_lossy().into_owned())
}
