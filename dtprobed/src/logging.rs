//! Logging setup: `stderr` via `env_logger` in the foreground (`-F`) case,
//! syslog via a small hand-rolled `log::Log` when daemonized — matching
//! spec.md §7's "syslog when daemonised; stderr in foreground".

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::ffi::CString;
use std::sync::Once;

static SYSLOG_OPEN: Once = Once::new();

pub struct SyslogLogger {
    level: LevelFilter,
}

impl SyslogLogger {
    fn new(level: LevelFilter) -> Self {
        SYSLOG_OPEN.call_once(|| {
            let ident = CString::new("dtprobed").unwrap();
            // Leak deliberately: openlog keeps a pointer to this string for
            // the life of the process, which is exactly how long we need it.
            let ident = Box::leak(Box::new(ident));
            unsafe {
                libc::openlog(ident.as_ptr(), libc::LOG_PID | libc::LOG_NDELAY, libc::LOG_DAEMON);
            }
        });
        Self { level }
    }
}

impl Log for SyslogLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let priority = match record.level() {
            Level::Error => libc::LOG_ERR,
            Level::Warn => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };
        let msg = format!("{}", record.args());
        if let Ok(cmsg) = CString::new(msg) {
            unsafe {
                libc::syslog(priority, c"%s".as_ptr(), cmsg.as_ptr());
            }
        }
    }

    fn flush(&self) {}
}

impl Drop for SyslogLogger {
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

/// Installs the appropriate global logger. `foreground` selects
/// `env_logger` (stderr); otherwise the syslog logger is installed at
/// `debug`-or-`info` level depending on `debug`.
pub fn init(foreground: bool, debug: bool) {
    if foreground {
        env_logger::init();
        return;
    }

    let level = if debug { LevelFilter::Debug } else { LevelFilter::Info };
    let logger = Box::new(SyslogLogger::new(level));
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
