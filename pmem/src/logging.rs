/// Level-gated diagnostics behind the `log` facade.
///
/// `<PREFIX>_LOG_LEVEL` selects a numeric level 0-15 (0 disables output);
/// `<PREFIX>_LOG_FILE` redirects output to a file (`-` means stderr).
/// Logging never touches persistent state and never takes library locks.
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Default level when `<PREFIX>_LOG_LEVEL` is unset: errors only.
const DEFAULT_LEVEL: u8 = 1;
const MAX_LEVEL: u8 = 15;

enum Sink {
    Stderr,
    File(Mutex<File>),
}

struct Logger {
    prefix: &'static str,
    level: u8,
    sink: Sink,
}

/// Map a facade level onto the numeric 1-15 scale: errors are always
/// interesting, traces only at the chattiest setting.
fn numeric(level: Level) -> u8 {
    match level {
        Level::Error => 1,
        Level::Warn => 2,
        Level::Info => 3,
        Level::Debug => 4,
        Level::Trace => 15,
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        numeric(metadata.level()) <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!(
            "<{}>: <{}> [{}:{}] {}\n",
            self.prefix,
            numeric(record.level()),
            record.file().unwrap_or("?"),
            record.line().unwrap_or(0),
            record.args()
        );

        match &self.sink {
            Sink::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Sink::File(f) => {
                let mut f = f.lock().unwrap();
                let _ = f.write_all(line.as_bytes());
            }
        }
    }

    fn flush(&self) {}
}

/// Install the logger once, configured from `<prefix>_LOG_LEVEL` and
/// `<prefix>_LOG_FILE`. A second call (e.g. another library flavor in the
/// same process) leaves the existing logger in place.
pub fn init(prefix: &'static str) {
    let level = std::env::var(format!("{}_LOG_LEVEL", prefix))
        .ok()
        .and_then(|v| v.parse::<u8>().ok())
        .map(|v| v.min(MAX_LEVEL))
        .unwrap_or(DEFAULT_LEVEL);

    let sink = match std::env::var(format!("{}_LOG_FILE", prefix)) {
        Ok(path) if path != "-" => match File::create(&path) {
            Ok(f) => Sink::File(Mutex::new(f)),
            Err(e) => {
                eprintln!("{}_LOG_FILE={}: {}", prefix, path, e);
                Sink::Stderr
            }
        },
        _ => Sink::Stderr,
    };

    let filter = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4..=14 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let logger = Logger { prefix, level, sink };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(filter);
    }
}

/// Report an internal invariant violation and abort the process. Used by
/// dispatch selection and the non-failing primitives; never reached on user
/// input.
pub fn fatal(msg: &str) -> ! {
    log::error!("fatal: {}", msg);
    eprintln!("fatal: {}", msg);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping_is_monotonic() {
        assert!(numeric(Level::Error) < numeric(Level::Warn));
        assert!(numeric(Level::Warn) < numeric(Level::Info));
        assert!(numeric(Level::Info) < numeric(Level::Debug));
        assert!(numeric(Level::Debug) < numeric(Level::Trace));
        assert_eq!(numeric(Level::Trace), MAX_LEVEL);
    }
}
