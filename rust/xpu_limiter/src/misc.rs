use std::path::Path;

use anyhow::{bail, Result};

/// CLOCK_MONOTONIC in nanoseconds. All liveness timestamps shared between
/// sibling processes on one host come from this clock.
pub fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn read_first_line(path: &Path) -> Result<String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => bail!("failed to read {:?}: {}", path, e),
    };
    match content.lines().next() {
        Some(line) => Ok(line.to_string()),
        None => bail!("{:?} is empty", path),
    }
}
