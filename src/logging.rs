//! Kernel Logging
//!
//! A `log::Log` backend that writes `[LEVEL] message` lines to a single
//! sink installed at boot. Diagnostics meant for the operator (fault
//! reports, trap frames, monitor output) go to the debug console
//! instead; this channel carries kernel tracing.

use alloc::boxed::Box;
use core::fmt::Write;
use core::str::FromStr;

use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

type Sink = Mutex<Box<dyn Write + Send>>;

static SINK: Once<Sink> = Once::new();
static LOGGER: KernelLogger = KernelLogger;

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            let _ = writeln!(sink.lock(), "[{:>5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger.
///
/// The first call wins the sink; later calls only adjust the level.
pub fn init<W>(sink: W, level: LevelFilter)
where
    W: Write + Send + 'static,
{
    SINK.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        Mutex::new(Box::new(sink))
    });
    log::set_max_level(level);
}

/// Parse a level name such as `"warn"`, falling back to `Info`.
pub fn parse_level(name: Option<&str>) -> LevelFilter {
    name.and_then(|s| LevelFilter::from_str(s).ok())
        .unwrap_or(LevelFilter::Info)
}
