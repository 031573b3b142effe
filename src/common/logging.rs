/*!

Kernel log output built on the log crate. Records are formatted into a
console sink installed by the platform layer with [`set_console`]; until a
sink is installed they are dropped.

*/

use core::fmt::{self, Write};

use log::{self, Level, LevelFilter, Log, Metadata, Record};
use spin::Mutex;

use super::utils::cpu_id;

/// Writes one already formatted chunk of text to the console.
pub type ConsoleSink = fn(&str);

static LOG_MUTEX: Mutex<()> = Mutex::new(());
static CONSOLE: Mutex<Option<ConsoleSink>> = Mutex::new(None);

pub fn set_console(sink: ConsoleSink) {
    *CONSOLE.lock() = Some(sink);
}

struct Stdout(ConsoleSink);

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        (self.0)(s);
        Ok(())
    }
}

struct SimpleLogger;

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }
    fn log(&self, record: &Record) {
        let _lock = LOG_MUTEX.lock();
        if !self.enabled(record.metadata()) {
            return;
        }
        let sink = match *CONSOLE.lock() {
            Some(sink) => sink,
            None => return,
        };
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 34,  // Blue
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        let _ = writeln!(
            Stdout(sink),
            "\u{1B}[{}m[{:>5} {}] {}\u{1B}[0m",
            color,
            record.level(),
            cpu_id(),
            record.args(),
        );
    }
    fn flush(&self) {
        let _lock = LOG_MUTEX.lock();
    }
}

/// Installs the kernel logger. Calling it more than once is harmless.
pub fn init() {
    static LOGGER: SimpleLogger = SimpleLogger;
    if log::set_logger(&LOGGER).is_err() {
        return;
    }
    log::set_max_level(match option_env!("LOG") {
        Some("ERROR") => LevelFilter::Error,
        Some("WARN") => LevelFilter::Warn,
        Some("INFO") => LevelFilter::Info,
        Some("DEBUG") => LevelFilter::Debug,
        Some("TRACE") => LevelFilter::Trace,
        _ => LevelFilter::Debug,
    });
}
