//! Measurement configuration: `section → parameter → value`.
//!
//! Stores describe their acquisition setup with flat `"section:parameter"`
//! keys. Each known parameter has a declared [`ParamKind`] and values are
//! coerced on assignment, so a malformed value fails where it enters the
//! dataset instead of somewhere downstream.

use std::collections::BTreeMap;
use std::fmt;

use log::warn;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// ConfigValue – a single coerced parameter value
// ---------------------------------------------------------------------------

/// A typed configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    Text(String),
}

impl ConfigValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value (integers widen to `f64`).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Int(i) => write!(f, "{i}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::IntList(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            ConfigValue::Text(s) => write!(f, "{s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// RawValue – what a backing store hands us
// ---------------------------------------------------------------------------

/// An uncoerced metadata value as read from a store.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Bytes(Vec<u8>),
    Int(i64),
    Float(f64),
    Bool(bool),
    List(Vec<i64>),
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Int(i)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// Declared parameter types
// ---------------------------------------------------------------------------

/// The parser selected for a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    IntList,
    /// Text folded to lower case.
    LowerStr,
    Str,
}

/// Known parameters and their declared kinds.
const PARAMETERS: &[(&str, &str, ParamKind)] = &[
    ("experiment", "date", ParamKind::Str),
    ("experiment", "event count", ParamKind::Int),
    ("experiment", "run index", ParamKind::Int),
    ("experiment", "sample", ParamKind::Str),
    ("experiment", "time", ParamKind::Str),
    ("filtering", "enable filters", ParamKind::Bool),
    ("filtering", "hierarchy parent", ParamKind::Str),
    ("filtering", "limit events", ParamKind::Int),
    ("filtering", "remove invalid events", ParamKind::Bool),
    ("fluorescence", "channel count", ParamKind::Int),
    ("fluorescence", "channels installed", ParamKind::IntList),
    ("fluorescence", "laser count", ParamKind::Int),
    ("fluorescence", "lasers installed", ParamKind::IntList),
    ("fluorescence", "sample rate", ParamKind::Float),
    ("fluorescence", "trace median", ParamKind::Int),
    ("fmt_tdms", "video frame offset", ParamKind::Int),
    ("imaging", "flash device", ParamKind::Str),
    ("imaging", "frame rate", ParamKind::Float),
    ("imaging", "pixel size", ParamKind::Float),
    ("imaging", "roi size x", ParamKind::Int),
    ("imaging", "roi size y", ParamKind::Int),
    ("online_contour", "bin area min", ParamKind::Int),
    ("online_contour", "no absdiff", ParamKind::Bool),
    ("setup", "channel width", ParamKind::Float),
    ("setup", "chip region", ParamKind::LowerStr),
    ("setup", "flow rate", ParamKind::Float),
    ("setup", "medium", ParamKind::Str),
    ("setup", "software version", ParamKind::Str),
];

/// Look up the declared kind of a parameter.
pub fn param_kind(section: &str, key: &str) -> Option<ParamKind> {
    PARAMETERS
        .iter()
        .find(|(s, k, _)| *s == section && *k == key)
        .map(|(_, _, kind)| *kind)
}

fn to_text(raw: RawValue) -> std::result::Result<String, String> {
    match raw {
        RawValue::Text(s) => Ok(s),
        RawValue::Bytes(b) => String::from_utf8(b).map_err(|e| format!("not UTF-8: {e}")),
        RawValue::Int(i) => Ok(i.to_string()),
        RawValue::Float(v) => Ok(v.to_string()),
        RawValue::Bool(b) => Ok(b.to_string()),
        RawValue::List(items) => Ok(ConfigValue::IntList(items).to_string()),
    }
}

fn parse_bool(raw: RawValue) -> std::result::Result<bool, String> {
    match raw {
        RawValue::Bool(b) => Ok(b),
        RawValue::Int(i) => Ok(i != 0),
        RawValue::Float(v) => Ok(v != 0.0),
        other => {
            let text = to_text(other)?.to_lowercase();
            match text.trim() {
                "true" => Ok(true),
                "false" => Ok(false),
                "" => Err("empty string".to_string()),
                num => num
                    .parse::<f64>()
                    .map(|v| v != 0.0)
                    .map_err(|_| format!("'{num}' is not a boolean")),
            }
        }
    }
}

fn parse_int_list(raw: RawValue) -> std::result::Result<Vec<i64>, String> {
    if let RawValue::List(items) = raw {
        return Ok(items);
    }
    let text = to_text(raw)?;
    text.trim()
        .trim_matches(|c: char| c == '[' || c == ']' || c.is_whitespace())
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<i64>()
                .map_err(|_| format!("'{item}' is not an integer"))
        })
        .collect()
}

fn parse_int(raw: RawValue) -> std::result::Result<i64, String> {
    match raw {
        RawValue::Int(i) => Ok(i),
        RawValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Ok(v as i64),
        RawValue::Bool(_) | RawValue::List(_) => Err("expected an integer".to_string()),
        other => {
            let text = to_text(other)?;
            let trimmed = text.trim();
            trimmed.parse::<i64>().or_else(|_| {
                // Some writers store counts as "1234.0".
                match trimmed.parse::<f64>() {
                    Ok(v) if v.fract() == 0.0 && v.is_finite() => Ok(v as i64),
                    _ => Err(format!("'{trimmed}' is not an integer")),
                }
            })
        }
    }
}

fn parse_float(raw: RawValue) -> std::result::Result<f64, String> {
    match raw {
        RawValue::Float(v) => Ok(v),
        RawValue::Int(i) => Ok(i as f64),
        RawValue::Bool(_) | RawValue::List(_) => Err("expected a number".to_string()),
        other => {
            let text = to_text(other)?;
            text.trim()
                .parse::<f64>()
                .map_err(|_| format!("'{}' is not a number", text.trim()))
        }
    }
}

/// Coerce a raw value to the declared kind.
pub fn coerce(kind: ParamKind, raw: RawValue) -> std::result::Result<ConfigValue, String> {
    match kind {
        ParamKind::Bool => parse_bool(raw).map(ConfigValue::Bool),
        ParamKind::Int => parse_int(raw).map(ConfigValue::Int),
        ParamKind::Float => parse_float(raw).map(ConfigValue::Float),
        ParamKind::IntList => parse_int_list(raw).map(ConfigValue::IntList),
        ParamKind::LowerStr => to_text(raw).map(|s| ConfigValue::Text(s.to_lowercase())),
        ParamKind::Str => to_text(raw).map(ConfigValue::Text),
    }
}

/// Split a flat metadata key into `(section, parameter)`.
///
/// Exactly one `:` is allowed and both halves must be non-empty.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once(':') {
        Some((section, param))
            if !section.is_empty() && !param.is_empty() && !param.contains(':') =>
        {
            Ok((section, param))
        }
        _ => Err(Error::DataIntegrity(format!(
            "malformed configuration key '{key}' (expected 'section:parameter')"
        ))),
    }
}

/// Section and parameter names must flatten back to a valid key.
fn check_name(section: &str, key: &str) -> Result<()> {
    let reason = if section.is_empty() || key.is_empty() {
        "section and parameter names must not be empty"
    } else if section.contains(':') || key.contains(':') {
        "section and parameter names must not contain ':'"
    } else {
        return Ok(());
    };
    Err(Error::Config {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

pub type Section = BTreeMap<String, ConfigValue>;

/// Sectioned, typed measurement metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    sections: BTreeMap<String, Section>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from flat `"section:parameter"` metadata.
    ///
    /// Either every entry is accepted or the whole load fails.
    pub fn from_flat<I, K>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, RawValue)>,
        K: AsRef<str>,
    {
        let mut config = Configuration::new();
        for (key, raw) in entries {
            let (section, param) = split_key(key.as_ref())?;
            config.set(section, param, raw)?;
        }
        Ok(config)
    }

    /// Assign a value, coercing it to the declared kind.
    ///
    /// Unknown parameters are kept as text. On failure the previous value
    /// stays in place.
    pub fn set(&mut self, section: &str, key: &str, raw: impl Into<RawValue>) -> Result<()> {
        check_name(section, key)?;
        let raw = raw.into();
        let value = match param_kind(section, key) {
            Some(kind) => coerce(kind, raw),
            None => {
                warn!("Unknown configuration key [{section}] '{key}', keeping it as text");
                coerce(ParamKind::Str, raw)
            }
        }
        .map_err(|reason| Error::Config {
            section: section.to_string(),
            key: key.to_string(),
            reason,
        })?;

        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Result<&ConfigValue> {
        self.section(section)?.get(key).ok_or_else(|| Error::Config {
            section: section.to_string(),
            key: key.to_string(),
            reason: "no such parameter".to_string(),
        })
    }

    pub fn section(&self, section: &str) -> Result<&Section> {
        self.sections.get(section).ok_or_else(|| Error::Config {
            section: section.to_string(),
            key: String::new(),
            reason: "no such section".to_string(),
        })
    }

    pub fn contains(&self, section: &str, key: &str) -> bool {
        self.sections
            .get(section)
            .is_some_and(|s| s.contains_key(key))
    }

    pub fn remove(&mut self, section: &str, key: &str) -> Option<ConfigValue> {
        self.sections.get_mut(section)?.remove(key)
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.keys().map(String::as_str)
    }

    /// Flatten back to `"section:parameter"` text pairs (sorted).
    pub fn to_flat(&self) -> Vec<(String, String)> {
        self.sections
            .iter()
            .flat_map(|(section, params)| {
                params
                    .iter()
                    .map(move |(key, value)| (format!("{section}:{key}"), value.to_string()))
            })
            .collect()
    }

    /// The stored `experiment:event count`, if any.
    pub fn event_count(&self) -> Option<usize> {
        self.sections
            .get("experiment")
            .and_then(|s| s.get("event count"))
            .and_then(ConfigValue::as_i64)
            .and_then(|n| usize::try_from(n).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing_follows_text_and_numbers() {
        assert_eq!(parse_bool("True".into()), Ok(true));
        assert_eq!(parse_bool("false".into()), Ok(false));
        assert_eq!(parse_bool("0.0".into()), Ok(false));
        assert_eq!(parse_bool("2".into()), Ok(true));
        assert_eq!(parse_bool(RawValue::Int(0)), Ok(false));
        assert!(parse_bool("".into()).is_err());
        assert!(parse_bool("maybe".into()).is_err());
    }

    #[test]
    fn int_list_accepts_bracketed_text() {
        assert_eq!(parse_int_list("[1, 2,3]".into()), Ok(vec![1, 2, 3]));
        assert_eq!(parse_int_list("1,,2".into()), Ok(vec![1, 2]));
        assert_eq!(parse_int_list("[]".into()), Ok(vec![]));
        assert!(parse_int_list("1,a".into()).is_err());
    }

    #[test]
    fn keys_split_on_exactly_one_colon() {
        assert_eq!(split_key("setup:flow rate").unwrap(), ("setup", "flow rate"));
        assert!(matches!(split_key("setup"), Err(Error::DataIntegrity(_))));
        assert!(matches!(split_key("a:b:c"), Err(Error::DataIntegrity(_))));
        assert!(matches!(split_key(":b"), Err(Error::DataIntegrity(_))));
    }

    #[test]
    fn set_rejects_names_that_cannot_be_flattened() {
        let mut config = Configuration::new();
        config.set("user", "note", "first").unwrap();
        for (section, key) in [("user", "note:a"), ("us:er", "note"), ("", "note"), ("user", "")] {
            assert!(
                matches!(config.set(section, key, "x"), Err(Error::Config { .. })),
                "{section:?} / {key:?}"
            );
        }
        assert_eq!(config.to_flat(), vec![("user:note".to_string(), "first".to_string())]);
        assert!(Configuration::from_flat(
            config.to_flat().into_iter().map(|(k, v)| (k, RawValue::Text(v)))
        )
        .is_ok());
    }

    #[test]
    fn from_flat_coerces_declared_types() {
        let config = Configuration::from_flat(vec![
            ("experiment:event count", RawValue::Bytes(b"127".to_vec())),
            ("setup:chip region", RawValue::from("Channel")),
            ("imaging:pixel size", RawValue::from("0.34")),
            ("fluorescence:channels installed", RawValue::from("1, 2")),
            ("experiment:sample", RawValue::Bytes("Zelle µ".as_bytes().to_vec())),
        ])
        .unwrap();

        assert_eq!(config.event_count(), Some(127));
        assert_eq!(config.get("setup", "chip region").unwrap().as_str(), Some("channel"));
        assert_eq!(config.get("imaging", "pixel size").unwrap().as_f64(), Some(0.34));
        assert_eq!(
            config.get("fluorescence", "channels installed").unwrap(),
            &ConfigValue::IntList(vec![1, 2])
        );
        assert_eq!(config.get("experiment", "sample").unwrap().as_str(), Some("Zelle µ"));
    }

    #[test]
    fn invalid_values_fail_loudly() {
        let err = Configuration::from_flat(vec![("imaging:pixel size", RawValue::from("wide"))])
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));

        let err = Configuration::from_flat(vec![(
            "experiment:sample",
            RawValue::Bytes(vec![0xff, 0xfe]),
        )])
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn failed_set_keeps_previous_value() {
        let mut config = Configuration::new();
        config.set("setup", "flow rate", 0.16).unwrap();
        assert!(config.set("setup", "flow rate", "fast").is_err());
        assert_eq!(config.get("setup", "flow rate").unwrap().as_f64(), Some(0.16));
    }

    #[test]
    fn missing_lookups_fail() {
        let config = Configuration::new();
        assert!(config.section("experiment").is_err());
        assert!(config.get("experiment", "sample").is_err());
        assert!(!config.contains("experiment", "sample"));
    }

    #[test]
    fn unknown_keys_are_kept_as_text() {
        let mut config = Configuration::new();
        config.set("user", "operator", "Ann").unwrap();
        assert_eq!(config.get("user", "operator").unwrap().as_str(), Some("Ann"));
        assert_eq!(config.to_flat(), vec![("user:operator".to_string(), "Ann".to_string())]);
    }
}
