//! Logging setup on top of flexi_logger
//!
//! Three output formats are supported: `text` (timestamp, level, message),
//! `ext` (text plus the emitting module as a path) and `json` (one compact
//! object per line, suitable for log shippers).

use crate::core::config::LoggingConfig;
use std::str::FromStr;
use strum_macros::{Display, EnumString};

// Handle of the running logger, kept so the level can be changed at runtime
static LOGGER_HANDLE: std::sync::OnceLock<std::sync::Mutex<flexi_logger::LoggerHandle>> =
    std::sync::OnceLock::new();

/// Output layout of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LogFormat {
    #[default]
    Text,
    Ext,
    Json,
}

/// Start the process-wide logger
///
/// Fails on a bad level string or an unwritable log file. Only one logger
/// can be installed per process.
pub fn init_logging(
    config: &LoggingConfig,
    color_enabled: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    use flexi_logger::{FileSpec, Logger};

    let format = LogFormat::from_str(&config.format).unwrap_or_default();
    let mut logger = Logger::try_with_str(&config.level)?;

    logger = match (format, color_enabled) {
        (LogFormat::Json, _) => logger.format(json_format),
        (LogFormat::Ext, true) => logger.format(extended_color_format),
        (LogFormat::Ext, false) => logger.format(extended_format),
        (LogFormat::Text, true) => logger.format(simple_color_format),
        (LogFormat::Text, false) => logger.format(simple_format),
    };

    if let Some(file_path) = config.file.as_deref() {
        let file_spec = FileSpec::try_from(std::path::Path::new(file_path))?;
        logger = logger.log_to_file(file_spec);
    }

    let handle = logger.start()?;
    let _ = LOGGER_HANDLE.set(std::sync::Mutex::new(handle));

    Ok(())
}

/// Change the active log level of a running logger
///
/// Only the level can change at runtime; format and file destination are
/// fixed by flexi_logger once the logger has started.
pub fn reconfigure_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let handle_mutex = LOGGER_HANDLE
        .get()
        .ok_or("Logger handle not initialised. Call init_logging first.")?;
    let mut handle = handle_mutex
        .lock()
        .map_err(|_| "Could not acquire logger handle lock")?;
    handle.parse_and_push_temp_spec(log_level)?;
    Ok(())
}

fn level_abbr(level: log::Level) -> &'static str {
    match level {
        log::Level::Error => "ERR",
        log::Level::Warn => "WRN",
        log::Level::Info => "INF",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRC",
    }
}

fn colored_level(level: log::Level) -> colored::ColoredString {
    use colored::Colorize;

    let abbr = level_abbr(level);
    match level {
        log::Level::Error => abbr.red().bold(),
        log::Level::Warn => abbr.yellow(),
        log::Level::Info => abbr.green(),
        log::Level::Debug => abbr.blue(),
        log::Level::Trace => abbr.magenta(),
    }
}

/// Shared layout of the text formats: timestamp, level, message and,
/// for `ext`, the emitting module as a source path
fn write_line(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
    color: bool,
    with_source: bool,
) -> Result<(), std::io::Error> {
    use colored::Colorize;

    let timestamp = now.format("%Y-%m-%d %H:%M:%S%.3f").to_string();
    if color {
        write!(
            w,
            "{} {} {}",
            timestamp.dimmed(),
            colored_level(record.level()),
            record.args()
        )?;
    } else {
        write!(w, "{} {} {}", timestamp, level_abbr(record.level()), record.args())?;
    }

    if with_source {
        let source = format_target_as_path(record.target(), record.line());
        if color {
            write!(w, " ({})", source.dimmed())?;
        } else {
            write!(w, " ({})", source)?;
        }
    }
    Ok(())
}

fn simple_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write_line(w, now, record, false, false)
}

fn simple_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write_line(w, now, record, true, false)
}

// "YYYY-MM-DD HH:mm:ss.fff INF message (consumer/manager.rs:42)"
fn extended_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write_line(w, now, record, false, true)
}

fn extended_color_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    write_line(w, now, record, true, true)
}

fn json_format(
    w: &mut dyn std::io::Write,
    now: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> Result<(), std::io::Error> {
    let line = serde_json::json!({
        "timestamp": now.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        "level": level_abbr(record.level()),
        "message": record.args().to_string(),
        "target": format_target_as_path(record.target(), record.line()),
    });
    serde_json::to_writer(w, &line).map_err(std::io::Error::from)
}

// clusterq::consumer::manager -> consumer/manager.rs
fn format_target_as_path(target: &str, line: Option<u32>) -> String {
    let path = match target.strip_prefix("clusterq::") {
        Some(module) => format!("{}.rs", module.replace("::", "/")),
        None if target == "clusterq" => "lib.rs".to_string(),
        None => target.replace("::", "/"),
    };
    match line {
        Some(line) => format!("{}:{}", path, line),
        None => path,
    }
}
