//! Session identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replay session ID.
///
/// Format: `replay-<date>-<time>-<random>`
/// Example: `replay-20260115-143022-abc123`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new session ID.
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        let random: String = uuid::Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect();
        SessionId(format!("replay-{}-{}", now.format("%Y%m%d-%H%M%S"), random))
    }

    /// Parse an existing session ID string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.starts_with("replay-") && s.len() > 22 {
            Some(SessionId(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_format() {
        let sid = SessionId::new();
        assert!(sid.0.starts_with("replay-"));
        assert_eq!(sid.0.len(), "replay-20260115-143022-abc123".len());
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_roundtrip() {
        let sid = SessionId::new();
        assert_eq!(SessionId::parse(sid.as_str()), Some(sid));
        assert_eq!(SessionId::parse("sess-123"), None);
    }
}
