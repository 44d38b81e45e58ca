use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::atomic::{AtomicUsize, Ordering};

static CONSOLE_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

fn level_from_usize(value: usize) -> LevelFilter {
    match value {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Return current console log level.
#[inline(always)]
pub fn console_level() -> LevelFilter {
    level_from_usize(CONSOLE_LEVEL.load(Ordering::Relaxed))
}

/// Change console log level at runtime, records above the level are dropped.
pub fn set_console_level(level: LevelFilter) {
    CONSOLE_LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level);
}

/// Logger that filters by [`console_level`] before delegating to `env_logger`.
struct ConsoleLogger {
    inner: env_logger::Logger,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= console_level() && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.inner.log(record)
        }
    }

    fn flush(&self) {
        self.inner.flush()
    }
}

/// Install process logger. Output goes to stderr since stdout may carry the editor channel.
///
/// # Arguments
///
/// * `level`: initial console level, `RUST_LOG` may narrow it further
pub fn init(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    let inner = env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp_millis()
        .build();
    log::set_boxed_logger(Box::new(ConsoleLogger { inner }))?;
    set_console_level(level);
    Ok(())
}

/// Log every line of `body` as a separate record.
pub fn log_multiline(target: &str, level: Level, body: &[u8]) {
    for line in body.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
        log::log!(target: target, level, "{}", String::from_utf8_lossy(line));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_level_conversion() {
        let levels = [
            LevelFilter::Off,
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        for level in levels {
            assert_eq!(level_from_usize(level as usize), level);
        }
    }
}
