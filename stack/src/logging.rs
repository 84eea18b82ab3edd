//! Logging bootstrap for the profile daemon.

use crate::config_util;
use log::LevelFilter;
use syslog::{BasicLogger, Facility, Formatter3164};

/// API to modify log levels at runtime.
pub trait IProfileLogging {
    /// Check whether debug logging is enabled.
    fn is_debug_enabled(&self) -> bool;

    /// Change whether debug logging is enabled.
    fn set_debug_logging(&mut self, enabled: bool);
}

/// Logging related implementation.
pub struct ProfileLogging {
    is_debug: bool,
}

impl ProfileLogging {
    /// Installs the global logger: stderr via env_logger, or syslog
    /// otherwise. A `log_level` entry in the config file overrides the
    /// command line default.
    pub fn new(is_debug: bool, log_output: &str) -> Self {
        let level = if is_debug { LevelFilter::Debug } else { LevelFilter::Info };
        let level = config_util::get_log_level().unwrap_or(level);

        if log_output == "stderr" {
            env_logger::Builder::new().filter(None, level).init();
        } else {
            let formatter = Formatter3164 {
                facility: Facility::LOG_USER,
                hostname: None,
                process: "btprofiled".into(),
                pid: 0,
            };

            let logger = syslog::unix(formatter).expect("could not connect to syslog");
            let _ = log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| log::set_max_level(level));
        }

        Self { is_debug: level == LevelFilter::Debug }
    }
}

impl IProfileLogging for ProfileLogging {
    fn is_debug_enabled(&self) -> bool {
        self.is_debug
    }

    fn set_debug_logging(&mut self, enabled: bool) {
        self.is_debug = enabled;

        let level = if self.is_debug { LevelFilter::Debug } else { LevelFilter::Info };
        log::set_max_level(level);

        log::info!("Setting debug logging to {}", self.is_debug);
    }
}
