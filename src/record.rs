use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Severity of an event, mapped from the numeric `System/Level` code.
///
/// The mapping is total: codes outside 0..=5 are kept as `Other(n)` and
/// displayed as `Level{n}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Level {
    LogAlways,
    Critical,
    Error,
    Warning,
    Info,
    Verbose,
    Other(i64),
}

impl Level {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Level::LogAlways,
            1 => Level::Critical,
            2 => Level::Error,
            3 => Level::Warning,
            4 => Level::Info,
            5 => Level::Verbose,
            n => Level::Other(n),
        }
    }

    /// Error and Critical events get a resolved message and show up in the error listing.
    pub fn is_error(self) -> bool { matches!(self, Level::Error | Level::Critical) }

    /// ANSI color used when painting the level name.
    pub fn color_code(self) -> &'static str {
        match self { Level::Critical => "1;31", Level::Error => "31", Level::Warning => "33", Level::Info => "34", _ => "37" }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::LogAlways => f.write_str("LogAlways"),
            Level::Critical => f.write_str("Critical"),
            Level::Error => f.write_str("Error"),
            Level::Warning => f.write_str("Warning"),
            Level::Info => f.write_str("Info"),
            Level::Verbose => f.write_str("Verbose"),
            Level::Other(n) => write!(f, "Level{}", n),
        }
    }
}

impl FromStr for Level {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LogAlways" => Ok(Level::LogAlways),
            "Critical" => Ok(Level::Critical),
            "Error" => Ok(Level::Error),
            "Warning" => Ok(Level::Warning),
            "Info" => Ok(Level::Info),
            "Verbose" => Ok(Level::Verbose),
            other => other
                .strip_prefix("Level")
                .and_then(|n| n.parse::<i64>().ok())
                .map(Level::Other)
                .ok_or_else(|| format!("unknown level name: {}", other)),
        }
    }
}

impl From<Level> for String {
    fn from(l: Level) -> String { l.to_string() }
}

impl TryFrom<String> for Level {
    type Error = String;
    fn try_from(s: String) -> Result<Self, String> { s.parse() }
}

/// One normalized event. This is also the shape of each line in the JSONL report.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Creation time, carried with the local offset it was displayed in.
    pub timestamp: DateTime<FixedOffset>,
    pub level: Level,
    pub source: String,
    pub event_id: u32,
    pub raw_level: i64,
    /// Empty unless `level` is Error or Critical.
    #[serde(default)]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_table_for_known_codes() {
        let names: Vec<String> = (0..=5).map(|c| Level::from_code(c).to_string()).collect();
        assert_eq!(names, ["LogAlways", "Critical", "Error", "Warning", "Info", "Verbose"]);
    }

    #[test]
    fn unknown_codes_fall_back_to_level_n() {
        assert_eq!(Level::from_code(6).to_string(), "Level6");
        assert_eq!(Level::from_code(255).to_string(), "Level255");
        assert_eq!(Level::from_code(17), Level::Other(17));
        assert_eq!(Level::from_code(-1).to_string(), "Level-1");
    }

    #[test]
    fn level_names_parse_back() {
        for code in [0, 1, 2, 3, 4, 5, 9, 200, -3] {
            let l = Level::from_code(code);
            assert_eq!(l.to_string().parse::<Level>().unwrap(), l);
        }
        assert!("Information".parse::<Level>().is_err());
        assert!("Levelx".parse::<Level>().is_err());
    }

    #[test]
    fn only_error_and_critical_are_errors() {
        assert!(Level::Error.is_error());
        assert!(Level::Critical.is_error());
        for l in [Level::LogAlways, Level::Warning, Level::Info, Level::Verbose, Level::Other(2)] {
            assert!(!l.is_error());
        }
    }

    #[test]
    fn record_serializes_level_as_name() {
        let rec = EventRecord {
            timestamp: DateTime::parse_from_rfc3339("2025-11-30T12:00:00+01:00").unwrap(),
            level: Level::Other(9),
            source: "Disk".to_string(),
            event_id: 7,
            raw_level: 9,
            message: String::new(),
        };
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["level"], "Level9");
        assert_eq!(v["raw_level"], 9);
        assert_eq!(v["event_id"], 7);
        assert_eq!(v["timestamp"], "2025-11-30T12:00:00+01:00");
        let back: EventRecord = serde_json::from_value(v.clone()).unwrap();
        assert_eq!(back, rec);
        let mut bad = v;
        bad["level"] = "Severe".into();
        assert!(serde_json::from_value::<EventRecord>(bad).is_err());
    }
}
