//! Installs the one `log::Log` implementor used for the lifetime of the
//! kernel: everything goes to the serial port.

use core::fmt::Write;
use x86_64::instructions::interrupts;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        interrupts::without_interrupts(|| {
            let mut serial = crate::serial::SERIAL1.lock();
            let _ = write!(
                serial,
                "[{:>5} {}] {}\n",
                record.level(),
                record.target(),
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

/// Install the logger and set the configured max level. Must run after
/// `serial::init()` and before any other subsystem logs.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(crate::config::DEFAULT_LOG_LEVEL);
}
