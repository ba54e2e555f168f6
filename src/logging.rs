use chrono::Utc;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Global file sink, installed once by the host process.
static CACHE_LOGGER: Lazy<Mutex<Option<CacheLogger>>> = Lazy::new(|| Mutex::new(None));

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));

/// Appends cache log lines to a log file and an error file.
pub struct CacheLogger {
    log_file_path: PathBuf,
    error_file_path: PathBuf,
}

impl CacheLogger {
    /// Install the file sink. Console output works without it.
    pub fn init(log_file_path: PathBuf, error_file_path: PathBuf) -> Result<(), String> {
        let logger = CacheLogger {
            log_file_path,
            error_file_path,
        };

        logger.ensure_files_writable()?;

        *CACHE_LOGGER.lock().unwrap_or_else(|e| e.into_inner()) = Some(logger);

        log_info("Cache logger initialized");

        Ok(())
    }

    /// Drop the file sink; later lines go to the console only.
    pub fn shutdown() {
        *CACHE_LOGGER.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn ensure_files_writable(&self) -> Result<(), String> {
        for path in [&self.log_file_path, &self.error_file_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create log directory: {}", e))?;
            }
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| format!("Cannot write to log file {}: {}", path.display(), e))?;
        }
        Ok(())
    }

    fn write_log(&self, level: &str, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let log_entry = format!("[{}] [{}] {}\n", timestamp, level, message);

        let file_path = match level {
            "ERROR" | "WARN" => &self.error_file_path,
            _ => &self.log_file_path,
        };

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(file_path) {
            let _ = file.write_all(log_entry.as_bytes());
            let _ = file.flush();
        }
    }
}

fn write_to_sink(level: &str, message: &str) {
    if let Ok(logger_guard) = CACHE_LOGGER.lock() {
        if let Some(logger) = logger_guard.as_ref() {
            logger.write_log(level, message);
        }
    }
}

pub fn set_debug_enabled(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

pub fn log_info(message: &str) {
    println!("[INFO] {}", message);
    write_to_sink("INFO", message);
}

pub fn log_warn(message: &str) {
    eprintln!("[WARN] {}", message);
    write_to_sink("WARN", message);
}

pub fn log_error(message: &str) {
    eprintln!("[ERROR] {}", message);
    write_to_sink("ERROR", message);
}

pub fn log_debug(message: &str) {
    if !debug_enabled() {
        return;
    }
    println!("[DEBUG] {}", message);
    write_to_sink("DEBUG", message);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logging::log_info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logging::log_warn(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logging::log_error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if $crate::logging::debug_enabled() {
            $crate::logging::log_debug(&format!($($arg)*))
        }
    };
}
