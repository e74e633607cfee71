use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// The operation a [`Command`] asks the table to perform.
///
/// On the wire an action is a bare string (`"add"`, `"remove"`, `"get"`,
/// `"getall"`). Anything else decodes into [`Action::Unknown`] so a bad
/// command reaches a worker and is reported there instead of failing decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    Add,
    Remove,
    Get,
    GetAll,
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Get => "get",
            Action::GetAll => "getall",
            Action::Unknown(raw) => raw,
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Action::Unknown(String::new())
    }
}

impl From<String> for Action {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "get" => Action::Get,
            "getall" => Action::GetAll,
            _ => Action::Unknown(raw),
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested operation on the table.
///
/// `value` only matters for [`Action::Add`] and `key` is ignored by
/// [`Action::GetAll`]. The timestamp never travels on the wire: it is stamped
/// when the command is decoded on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(skip, default = "SystemTime::now")]
    pub timestamp: SystemTime,
}

impl Command {
    pub fn new(action: Action, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            action,
            key: key.into(),
            value: value.into(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn add(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(Action::Add, key, value)
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(Action::Remove, key, "")
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Action::Get, key, "")
    }

    pub fn get_all() -> Self {
        Self::new(Action::GetAll, "", "")
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A row of the command table as handed out by `list_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableEntry {
    pub key: String,
    pub value: String,
    /// Nanoseconds since the Unix epoch.
    pub timestamp: i64,
}

impl fmt::Display for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Converts a wall-clock time into epoch nanoseconds, saturating at the
/// bounds of `i64`.
pub fn unix_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|nanos| -nanos)
            .unwrap_or(i64::MIN),
    }
}
