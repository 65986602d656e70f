//! Launch log, scripted crashes, and readiness output for mock processes.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

/// File that every launch is appended to, one `<name> <pid>` line each.
pub const LOG_ENV: &str = "MOCK_LOG";

/// Milliseconds after which the first launch recorded in the log exits
/// with a failure code. Later launches keep running.
pub const CRASH_FIRST_ENV: &str = "MOCK_CRASH_FIRST_MS";

/// One recorded launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub name: String,
    pub pid: u32,
}

/// Log to stderr, which the supervising station forwards line by line.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

/// Write a line to stdout and flush it past the pipe buffer.
pub fn announce(line: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{line}")?;
    out.flush()
}

/// Append this launch to the log named by [`LOG_ENV`].
///
/// Returns the number of launches recorded before this one, or 0 when no
/// log is configured.
pub fn record_launch(name: &str) -> io::Result<usize> {
    let Ok(path) = std::env::var(LOG_ENV) else {
        return Ok(0);
    };
    let previous = read_launches(Path::new(&path))?.len();
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{name} {}", std::process::id())?;
    Ok(previous)
}

/// Every launch recorded in `path`, oldest first. A missing file has none.
pub fn read_launches(path: &Path) -> io::Result<Vec<Launch>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(text
        .lines()
        .filter_map(|line| {
            let (name, pid) = line.split_once(' ')?;
            Some(Launch {
                name: name.to_string(),
                pid: pid.trim().parse().ok()?,
            })
        })
        .collect())
}

/// Whether a process with `pid` still exists.
pub fn is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// If this is the first launch and [`CRASH_FIRST_ENV`] is set, exit with
/// `code` after the configured delay.
pub fn arm_crash(previous_launches: usize, code: i32) {
    if previous_launches > 0 {
        return;
    }
    let Some(ms) = std::env::var(CRASH_FIRST_ENV)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return;
    };
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tracing::error!(code, "scripted crash");
        std::process::exit(code);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launches_parse_and_skip_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launches");
        std::fs::write(&path, "mock-airspy-tcp 101\nnoise\nmock-grh 202\n").unwrap();
        let launches = read_launches(&path).unwrap();
        assert_eq!(
            launches,
            vec![
                Launch { name: "mock-airspy-tcp".into(), pid: 101 },
                Launch { name: "mock-grh".into(), pid: 202 },
            ]
        );
        assert!(read_launches(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }
}
