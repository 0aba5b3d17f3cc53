use std::fs::File;
use std::path::Path;

use anyhow::Result;
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, SharedLogger, TermLogger, TerminalMode, WriteLogger};

pub const LOG_DIR: &str = "/var/log/xpu/";
const CONTAINER_ID_CUT_LEN: usize = 8;

fn level_from_env() -> LevelFilter {
    match std::env::var("XPU_LOG").as_deref() {
        Ok("off") => LevelFilter::Off,
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Warn,
    }
}

/// First 64-hex-digit run in the cgroup file, shortened; `nocontainer`
/// when the process runs outside a container.
pub fn container_id_short(cgroup_file: &Path) -> String {
    let Ok(content) = std::fs::read_to_string(cgroup_file) else {
        return "nocontainer".to_string();
    };
    find_hex64(&content)
        .map(|id| id[..CONTAINER_ID_CUT_LEN].to_string())
        .unwrap_or_else(|| "nocontainer".to_string())
}

fn find_hex64(content: &str) -> Option<&str> {
    let bytes = content.as_bytes();
    let mut run = 0;
    for (i, b) in bytes.iter().enumerate() {
        if b.is_ascii_hexdigit() && !b.is_ascii_uppercase() {
            run += 1;
            if run == 64 {
                return content.get(i + 1 - 64..i + 1);
            }
        } else {
            run = 0;
        }
    }
    None
}

/// Log to stderr, and additionally to
/// `/var/log/xpu/<container>-<pid>.log` when that directory exists.
pub fn init() -> Result<()> {
    let level = level_from_env();
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(LevelFilter::Error)
        .set_location_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off);
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        lcfg.build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )];
    if Path::new(LOG_DIR).is_dir() {
        let name = format!(
            "{}{}-{}.log",
            LOG_DIR,
            container_id_short(Path::new("/proc/self/cgroup")),
            std::process::id()
        );
        if let Ok(file) = File::options().append(true).create(true).open(&name) {
            loggers.push(WriteLogger::new(level, lcfg.build(), file));
        }
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn container_id_is_extracted_and_shortened() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "4:memory:/kubepods/pod1/{}\n",
            "0123456789abcdef".repeat(4)
        )
        .unwrap();
        assert_eq!(container_id_short(file.path()), "01234567");
    }

    #[test]
    fn short_hex_runs_do_not_count() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "4:memory:/kubepods/deadbeef\n").unwrap();
        assert_eq!(container_id_short(file.path()), "nocontainer");
    }

    #[test]
    fn missing_cgroup_file_is_nocontainer() {
        assert_eq!(
            container_id_short(Path::new("/nonexistent/cgroup")),
            "nocontainer"
        );
    }

    #[test]
    fn hex_run_at_end_of_content_is_found() {
        let id = "f".repeat(64);
        assert_eq!(find_hex64(&id), Some(id.as_str()));
        assert_eq!(find_hex64("xyz"), None);
    }
}
