// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entries delivered by sources, bookmarks into them, and the records built
//! from them for the ingestion endpoint.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Severity as reported by the source itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NativeLevel {
    LogAlways,
    Critical,
    Error,
    Warning,
    Information,
    Verbose,
    SuccessAudit,
    FailureAudit,
}

impl NativeLevel {
    /// Maps the standard numeric level codes (0 through 5).
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::LogAlways),
            1 => Some(Self::Critical),
            2 => Some(Self::Error),
            3 => Some(Self::Warning),
            4 => Some(Self::Information),
            5 => Some(Self::Verbose),
            _ => None,
        }
    }

    /// Numeric level code. Audit entries are logged at level 0.
    pub fn code(self) -> u8 {
        match self {
            Self::LogAlways | Self::SuccessAudit | Self::FailureAudit => 0,
            Self::Critical => 1,
            Self::Error => 2,
            Self::Warning => 3,
            Self::Information => 4,
            Self::Verbose => 5,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "logalways" => Some(Self::LogAlways),
            "critical" => Some(Self::Critical),
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "information" => Some(Self::Information),
            "verbose" => Some(Self::Verbose),
            "successaudit" => Some(Self::SuccessAudit),
            "failureaudit" => Some(Self::FailureAudit),
            _ => None,
        }
    }
}

impl fmt::Display for NativeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LogAlways => "LogAlways",
            Self::Critical => "Critical",
            Self::Error => "Error",
            Self::Warning => "Warning",
            Self::Information => "Information",
            Self::Verbose => "Verbose",
            Self::SuccessAudit => "Success Audit",
            Self::FailureAudit => "Failure Audit",
        };
        write!(f, "{name}")
    }
}

// Listener files carry either level names or the numeric codes.
impl<'de> Deserialize<'de> for NativeLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelVisitor;

        impl de::Visitor<'_> for LevelVisitor {
            type Value = NativeLevel;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a level name or a numeric level code")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<NativeLevel, E> {
                NativeLevel::from_code(v)
                    .ok_or_else(|| E::custom(format!("unknown level code {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<NativeLevel, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("unknown level code {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NativeLevel, E> {
                NativeLevel::from_name(v).ok_or_else(|| E::custom(format!("unknown level '{v}'")))
            }
        }

        deserializer.deserialize_any(LevelVisitor)
    }
}

/// Audit outcome keywords a source may attach to an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keywords {
    #[serde(default)]
    pub audit_success: bool,
    #[serde(default)]
    pub audit_failure: bool,
}

impl Keywords {
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.audit_success {
            names.push("Audit Success");
        }
        if self.audit_failure {
            names.push("Audit Failure");
        }
        names
    }
}

/// One unit of data delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: Option<NativeLevel>,
    #[serde(default)]
    pub keywords: Option<Keywords>,
    pub provider: String,
    pub event_id: u32,
    /// Source-assigned sequence number, used for deduplication.
    pub record_id: u64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// Opaque position token; only the issuing source can interpret it.
    #[serde(default)]
    pub position: String,
}

impl Entry {
    pub fn bookmark(&self) -> Bookmark {
        Bookmark::new(self.position.clone())
    }

    /// First non-empty line of the description.
    pub fn summary(&self) -> &str {
        self.description
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or_default()
    }
}

/// Resumable cursor into one source's entry sequence.
///
/// Equality and ordering of tokens are meaningful only to the source that
/// issued them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub token: String,
    pub captured_at: DateTime<Utc>,
}

impl Bookmark {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            captured_at: Utc::now(),
        }
    }
}

/// Canonical four-level scale understood by the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Debug,
    Information,
    Warning,
    Error,
}

impl Level {
    /// Audit keywords win over the native level.
    pub fn map(native: Option<NativeLevel>, keywords: Option<Keywords>) -> Self {
        if let Some(keywords) = keywords {
            if keywords.audit_success {
                return Level::Information;
            }
            if keywords.audit_failure {
                return Level::Warning;
            }
        }
        match native {
            Some(NativeLevel::Information) => Level::Information,
            Some(NativeLevel::Warning) => Level::Warning,
            Some(NativeLevel::Error) => Level::Error,
            Some(NativeLevel::SuccessAudit) => Level::Information,
            Some(NativeLevel::FailureAudit) => Level::Warning,
            _ => Level::Debug,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Debug => write!(f, "Debug"),
            Level::Information => write!(f, "Information"),
            Level::Warning => write!(f, "Warning"),
            Level::Error => write!(f, "Error"),
        }
    }
}

/// Tag value attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Text(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Text(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Integer(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

/// Structured record handed to the forwarder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub summary: String,
    pub message_template: String,
    pub tags: BTreeMap<String, TagValue>,
}

impl Record {
    /// Adds a tag unless the key is already taken.
    pub fn tag_if_absent(&mut self, key: impl Into<String>, value: impl Into<TagValue>) {
        self.tags.entry(key.into()).or_insert_with(|| value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping_is_exact() {
        assert_eq!(Level::map(Some(NativeLevel::Information), None), Level::Information);
        assert_eq!(Level::map(Some(NativeLevel::Warning), None), Level::Warning);
        assert_eq!(Level::map(Some(NativeLevel::Error), None), Level::Error);
        assert_eq!(Level::map(Some(NativeLevel::SuccessAudit), None), Level::Information);
        assert_eq!(Level::map(Some(NativeLevel::FailureAudit), None), Level::Warning);
        assert_eq!(Level::map(Some(NativeLevel::Critical), None), Level::Debug);
        assert_eq!(Level::map(Some(NativeLevel::Verbose), None), Level::Debug);
        assert_eq!(Level::map(None, None), Level::Debug);
    }

    #[test]
    fn test_audit_keywords_override_level() {
        let success = Keywords {
            audit_success: true,
            audit_failure: false,
        };
        let failure = Keywords {
            audit_success: false,
            audit_failure: true,
        };
        assert_eq!(Level::map(Some(NativeLevel::Error), Some(success)), Level::Information);
        assert_eq!(Level::map(None, Some(failure)), Level::Warning);
        assert_eq!(
            Level::map(Some(NativeLevel::Error), Some(Keywords::default())),
            Level::Error
        );
    }

    #[test]
    fn test_level_codes_round_trip() {
        for code in 0..=5 {
            let level = NativeLevel::from_code(code).unwrap();
            assert_eq!(u64::from(level.code()), code);
        }
        assert_eq!(NativeLevel::SuccessAudit.code(), 0);
        assert_eq!(NativeLevel::FailureAudit.code(), 0);
    }

    #[test]
    fn test_native_level_accepts_names_and_codes() {
        let levels: Vec<NativeLevel> =
            serde_json::from_str(r#"["Warning", 2, "failure audit", "Success_Audit"]"#).unwrap();
        assert_eq!(
            levels,
            vec![
                NativeLevel::Warning,
                NativeLevel::Error,
                NativeLevel::FailureAudit,
                NativeLevel::SuccessAudit
            ]
        );
        assert!(serde_json::from_str::<NativeLevel>("9").is_err());
        assert!(serde_json::from_str::<NativeLevel>(r#""loud""#).is_err());
    }

    #[test]
    fn test_summary_is_first_non_empty_line() {
        let entry = Entry {
            timestamp: Utc::now(),
            level: None,
            keywords: None,
            provider: "disk".to_string(),
            event_id: 7,
            record_id: 1,
            description: "\n  The device has a bad block.  \nDetails follow".to_string(),
            payload: BTreeMap::new(),
            position: "0".to_string(),
        };
        assert_eq!(entry.summary(), "The device has a bad block.");
        assert_eq!(entry.bookmark().token, "0");
    }

    #[test]
    fn test_tag_values_deserialize_untagged() {
        let tags: BTreeMap<String, TagValue> =
            serde_json::from_str(r#"{"team":"ops","priority":2,"page":true,"weight":0.5}"#)
                .unwrap();
        assert_eq!(tags["team"], TagValue::Text("ops".to_string()));
        assert_eq!(tags["priority"], TagValue::Integer(2));
        assert_eq!(tags["page"], TagValue::Bool(true));
        assert_eq!(tags["weight"], TagValue::Float(0.5));
    }

    #[test]
    fn test_tag_if_absent_keeps_existing() {
        let mut record = Record {
            timestamp: Utc::now(),
            level: Level::Debug,
            summary: String::new(),
            message_template: String::new(),
            tags: BTreeMap::new(),
        };
        record.tag_if_absent("EventId", 1_i64);
        record.tag_if_absent("EventId", 2_i64);
        assert_eq!(record.tags["EventId"], TagValue::Integer(1));
    }
}
