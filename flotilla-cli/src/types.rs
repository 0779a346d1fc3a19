//! Common types used across CLI modules

use uuid::Uuid;

/// Identifier that can be either a full UUID or an unambiguous prefix
#[derive(Debug, Clone)]
pub enum IdOrPrefix {
    /// Full UUID
    Full(Uuid),
    /// Prefix that should uniquely identify a job
    Prefix(String),
}

impl IdOrPrefix {
    /// Parse a string into an IdOrPrefix
    ///
    /// Attempts to parse as a full UUID first, otherwise treats as a prefix
    pub fn parse(input: &str) -> Self {
        if let Ok(uuid) = Uuid::parse_str(input) {
            IdOrPrefix::Full(uuid)
        } else {
            IdOrPrefix::Prefix(input.to_lowercase())
        }
    }

    /// Get the UUID if this is a full ID
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            IdOrPrefix::Full(uuid) => Some(*uuid),
            IdOrPrefix::Prefix(_) => None,
        }
    }

    /// True if `uuid` is this ID or starts with this prefix
    pub fn matches(&self, uuid: Uuid) -> bool {
        match self {
            IdOrPrefix::Full(full) => *full == uuid,
            IdOrPrefix::Prefix(prefix) => uuid.to_string().starts_with(prefix.as_str()),
        }
    }
}

impl std::fmt::Display for IdOrPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdOrPrefix::Full(uuid) => write!(f, "{}", uuid),
            IdOrPrefix::Prefix(prefix) => write!(f, "{}", prefix),
        }
    }
}

/// Parses a `key=value` argument
pub fn parse_key_value(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{}'", input)),
    }
}
