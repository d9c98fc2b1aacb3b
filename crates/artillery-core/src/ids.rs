use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TaskError;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }
            pub fn from_str(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

id_newtype!(LockOwner);
id_newtype!(RunId);

pub const MAX_TASK_NAME_LEN: usize = 64;

/// Identity of a task. Doubles as the record's directory name, so the
/// character set is restricted to `[A-Za-z0-9_-]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskName(String);

impl TaskName {
    /// Strict check used by the store. Never rewrites the input.
    pub fn parse(raw: &str) -> Result<Self, TaskError> {
        let invalid = |reason: &str| TaskError::InvalidName {
            name: raw.to_string(),
            reason: reason.to_string(),
        };
        if raw.is_empty() {
            return Err(invalid("name is empty"));
        }
        if raw.len() > MAX_TASK_NAME_LEN {
            return Err(invalid("name is longer than 64 characters"));
        }
        if raw.starts_with('-') {
            return Err(invalid("name must not start with '-'"));
        }
        if let Some(c) = raw.chars().find(|c| !is_name_char(*c)) {
            return Err(invalid(&format!("character {c:?} is not allowed")));
        }
        Ok(Self(raw.to_string()))
    }

    /// Maps free text to a valid name the way the task form always has:
    /// trim, then replace every disallowed character with `_`.
    pub fn sanitize(raw: &str) -> Result<Self, TaskError> {
        let cleaned: String = raw
            .trim()
            .chars()
            .map(|c| if is_name_char(c) { c } else { '_' })
            .collect();
        let cleaned = cleaned.trim_start_matches('-');
        Self::parse(cleaned)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name with underscores shown as spaces, for listings.
    pub fn display_name(&self) -> String {
        self.0.replace('_', " ")
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TaskName {
    type Error = TaskError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskName> for String {
    fn from(value: TaskName) -> Self {
        value.0
    }
}

impl AsRef<str> for TaskName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
