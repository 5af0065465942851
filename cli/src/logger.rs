use console::style;
use log::{Level, LevelFilter, Metadata, Record};

struct StderrLogger;
static STDERR_LOGGER: StderrLogger = StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(
        &self,
        metadata: &Metadata<'_>,
    ) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(
        &self,
        record: &Record<'_>,
    ) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => style("ERROR").red().bold(),
            Level::Warn => style("WARN").yellow().bold(),
            Level::Info => style("INFO").green(),
            Level::Debug => style("DEBUG").cyan(),
            Level::Trace => style("TRACE").dim(),
        };
        eprintln!("{level} {}: {}", record.target(), record.args());
    }

    fn flush(&self) {}
}

pub fn level_for(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Installs the stderr logger. A logger installed earlier stays in place.
pub fn install(verbosity: u8) {
    let _ = log::set_logger(&STDERR_LOGGER)
        .map(|_| log::set_max_level(level_for(verbosity)));
}
