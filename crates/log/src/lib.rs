//! Process-wide leveled logging for the block tree crates.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

pub const LEVEL_ENV: &str = "BLOCKTREE_LOG_LEVEL";
pub const FORMAT_ENV: &str = "BLOCKTREE_LOG_FORMAT";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogConfig {
    pub level: Level,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Info,
            format: Format::Text,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Reads `BLOCKTREE_LOG_LEVEL` and `BLOCKTREE_LOG_FORMAT`; unset or unparsable values keep
    /// the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(level) = lookup(LEVEL_ENV).as_deref().and_then(Level::parse) {
            config.level = level;
        }
        if let Some(format) = lookup(FORMAT_ENV).as_deref().and_then(Format::parse) {
            config.format = format;
        }
        config
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);

pub fn init(config: LogConfig) {
    LOG_LEVEL.store(config.level as u8, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }
    let record = Record {
        level,
        target,
        file,
        line,
        at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default(),
    };
    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let rendered = record.render(format, LOG_TIMESTAMPS.load(Ordering::Relaxed), args);
    let _ = writeln!(io::stderr().lock(), "{rendered}");
}

struct Record {
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    at: Duration,
}

impl Record {
    fn render(&self, format: Format, timestamps: bool, args: fmt::Arguments<'_>) -> String {
        match format {
            Format::Text if timestamps => {
                let ts = Timestamp {
                    unix_seconds: self.at.as_secs(),
                    millis: self.at.subsec_millis(),
                };
                format!("{ts} {} {}: {args}", self.level.as_str(), self.target)
            }
            Format::Text => format!("{} {}: {args}", self.level.as_str(), self.target),
            Format::Json => json!({
                "ts_ms": u64::try_from(self.at.as_millis()).unwrap_or(u64::MAX),
                "level": self.level.as_str(),
                "target": self.target,
                "file": self.file,
                "line": self.line,
                "msg": args.to_string(),
            })
            .to_string(),
        }
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.millis
        )
    }
}

// Howard Hinnant's days-to-civil conversion.
fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (y + i32::from(m <= 2), m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level() {
        assert_eq!(Level::parse("info"), Some(Level::Info));
        assert_eq!(Level::parse("WARN"), Some(Level::Warn));
        assert_eq!(Level::parse("warning"), Some(Level::Warn));
        assert_eq!(Level::parse("nope"), None);
    }

    #[test]
    fn parse_format() {
        assert_eq!(Format::parse("text"), Some(Format::Text));
        assert_eq!(Format::parse("JSON"), Some(Format::Json));
        assert_eq!(Format::parse("nope"), None);
    }

    #[test]
    fn config_from_lookup() {
        let config = LogConfig::from_lookup(|key| match key {
            LEVEL_ENV => Some("debug".to_string()),
            FORMAT_ENV => Some("json".to_string()),
            _ => None,
        });
        assert_eq!(config.level, Level::Debug);
        assert_eq!(config.format, Format::Json);

        let config = LogConfig::from_lookup(|_| Some("garbage".to_string()));
        assert_eq!(config, LogConfig::default());
    }

    #[test]
    fn timestamp_formats_as_utc() {
        let ts = Timestamp {
            unix_seconds: 1_231_006_505,
            millis: 7,
        };
        assert_eq!(ts.to_string(), "2009-01-03T18:15:05.007Z");
    }

    fn record() -> Record {
        Record {
            level: Level::Warn,
            target: "blocktree_chainstate::tree",
            file: "crates/chainstate/src/tree.rs",
            line: 42,
            at: Duration::from_millis(1_231_006_505_250),
        }
    }

    #[test]
    fn text_record_layout() {
        let record = record();
        assert_eq!(
            record.render(Format::Text, true, format_args!("marked {} failed", 3)),
            "2009-01-03T18:15:05.250Z WARN blocktree_chainstate::tree: marked 3 failed"
        );
        assert_eq!(
            record.render(Format::Text, false, format_args!("plain")),
            "WARN blocktree_chainstate::tree: plain"
        );
    }

    #[test]
    fn json_record_fields() {
        let rendered = record().render(Format::Json, true, format_args!("height {}", 10));
        let value: serde_json::Value = serde_json::from_str(&rendered).expect("json");
        assert_eq!(value["ts_ms"], 1_231_006_505_250u64);
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["line"], 42);
        assert_eq!(value["msg"], "height 10");
    }
}
